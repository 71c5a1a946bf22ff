
/// A fixed-size window of the most recent `N` samples, with mean and standard deviation
///  maintained incrementally.
pub struct RollingData<const N: usize> {
    buf: BufferImpl<N>,
    cached_sum: f64,
    cached_square_sum: f64,
}
impl<const N: usize> Default for RollingData<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RollingData<N> {
    pub fn new() -> Self {
        assert!(N > 0);

        RollingData {
            buf: BufferImpl::new(),
            cached_sum: 0.0,
            cached_square_sum: 0.0,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted;
            self.cached_square_sum -= evicted * evicted;
        }

        self.cached_sum += value;
        self.cached_square_sum += value * value;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(self.cached_sum / self.buf.len() as f64)
    }

    pub fn std_dev(&self) -> f64 {
        if self.buf.len() < 2 {
            // pragmatic value that serves the purpose of standard deviation in this context
            return 0.0;
        }

        let mean = self.cached_sum / self.buf.len() as f64;
        let diff_of_squares = self.cached_square_sum - mean * mean * self.buf.len() as f64;

        // rounding can make the difference slightly negative for constant samples
        (diff_of_squares.max(0.0) / (self.buf.len() - 1) as f64).sqrt()
    }
}


enum BufferImpl<const N: usize> {
    Growing(Vec<f64>),
    Ring {
        buf: Vec<f64>,
        next: usize,
    },
}
impl <const N: usize> BufferImpl<N> {
    fn new() -> BufferImpl<N> {
        BufferImpl::Growing(Vec::with_capacity(N))
    }

    fn len(&self) -> usize {
        match self {
            BufferImpl::Growing(buf) => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: f64) -> Option<f64> {
        match self {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}
