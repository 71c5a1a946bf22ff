use crate::error::ChannelError;
use crate::packet::FragmentHeader;
use crate::safe_converter::SafeCast;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;

struct FragmentGroup {
    parts: Vec<Option<Bytes>>,
    num_received: usize,
    num_bytes: usize,
}

/// Reassembles fragmented messages on the receiving side of a reliable channel.
///
/// Fragments are acknowledged when they are received, so an incomplete group is never dropped
///  to make room: its missing parts would not be sent again. A fragment starting a group beyond
///  `max_incomplete_groups` is rejected before it is acknowledged instead.
pub struct FragmentAssembler {
    max_incomplete_groups: usize,
    max_message_size: usize,
    groups: FxHashMap<u16, FragmentGroup>,
}

impl FragmentAssembler {
    pub fn new(max_incomplete_groups: usize, max_message_size: usize) -> FragmentAssembler {
        FragmentAssembler {
            max_incomplete_groups,
            max_message_size,
            groups: FxHashMap::default(),
        }
    }

    pub fn num_incomplete_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn validate_header(header: &FragmentHeader) -> Result<(), ChannelError> {
        if header.count == 0 {
            return Err(ChannelError::ProtocolViolation("fragment count 0".to_string()));
        }
        if header.index >= header.count {
            return Err(ChannelError::ProtocolViolation(format!("fragment index {} for fragment count {}", header.index, header.count)));
        }
        Ok(())
    }

    /// Checks a fragment header against the header itself and against the group it belongs to,
    ///  if that group is being reassembled
    pub fn check(&self, header: &FragmentHeader) -> Result<(), ChannelError> {
        Self::validate_header(header)?;
        match self.groups.get(&header.group_id) {
            Some(group) if group.parts.len() != header.count.safe_cast() => {
                Self::count_mismatch(header, group)
            }
            _ => Ok(()),
        }
    }

    /// Checks that a fragment either belongs to a group that is being reassembled, or that
    ///  there is room for a new group
    pub fn check_room(&self, header: &FragmentHeader) -> Result<(), ChannelError> {
        if self.groups.contains_key(&header.group_id) || self.groups.len() < self.max_incomplete_groups {
            return Ok(());
        }
        Err(ChannelError::ProtocolViolation(format!("fragment group {} exceeds the limit of {} incomplete groups", header.group_id, self.max_incomplete_groups)))
    }

    fn count_mismatch<T>(header: &FragmentHeader, group: &FragmentGroup) -> Result<T, ChannelError> {
        let msg = format!("fragment count {} for group {} which has {} fragments", header.count, header.group_id, group.parts.len());
        Err(ChannelError::ProtocolViolation(msg))
    }

    /// Adds a fragment, returning the reassembled message if this fragment completes its group.
    ///  Fragments that were already received are ignored.
    pub fn add(&mut self, header: FragmentHeader, payload: Bytes) -> Result<Option<Bytes>, ChannelError> {
        Self::validate_header(&header)?;
        self.check_room(&header)?;

        let group = self.groups.entry(header.group_id)
            .or_insert_with(|| FragmentGroup {
                parts: vec![None; header.count.safe_cast()],
                num_received: 0,
                num_bytes: 0,
            });

        if group.parts.len() != header.count.safe_cast() {
            return Self::count_mismatch(&header, group);
        }

        let idx: usize = header.index.safe_cast();
        if group.parts[idx].is_some() {
            trace!("duplicate fragment {} of group {} - ignoring", header.index, header.group_id);
            return Ok(None);
        }

        group.num_bytes += payload.len();
        if group.num_bytes > self.max_message_size {
            self.groups.remove(&header.group_id);
            return Err(ChannelError::ProtocolViolation(format!("fragment group {} exceeds the maximum message size", header.group_id)));
        }

        group.parts[idx] = Some(payload);
        group.num_received += 1;
        if group.num_received < group.parts.len() {
            return Ok(None);
        }

        let parts = std::mem::take(&mut group.parts);
        let mut message = BytesMut::with_capacity(group.num_bytes);
        self.groups.remove(&header.group_id);
        for part in parts.into_iter().flatten() {
            message.extend_from_slice(&part);
        }
        Ok(Some(message.freeze()))
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}
