use anyhow::anyhow;


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow: {} bytes required, {} remaining", size_of::<$ty>(), self.remaining()));
            }
            Ok(self.$getter())
        }
    }
}

/// Checked reads in network byte order. The names differ from `Buf`'s own `try_get_*` family
///  on purpose so both can be in scope.
pub trait BufExt: bytes::Buf {
    get_try_impl!(try_read_u8, u8, get_u8);
    get_try_impl!(try_read_u16, u16, get_u16);
    get_try_impl!(try_read_u32, u32, get_u32);
    get_try_impl!(try_read_u64, u64, get_u64);
}

impl <T: bytes::Buf> BufExt for T {
}
