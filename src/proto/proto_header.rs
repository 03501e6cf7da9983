use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const PROTO_HEADER_SIZE: usize = 16;
pub const PROTO_MAX_FRAME_SIZE: usize = 65535;
pub const PROTO_MAX_FRAME_DATA_SIZE: usize = PROTO_MAX_FRAME_SIZE - PROTO_HEADER_SIZE;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum FrameType {
    Data = 0,
    ChannelQuery = 1,
    ChannelAllow = 2,
    ChannelDeny = 3,
    Ping = 4,
    Pong = 5,
    DeliveryAck = 6,
}

impl FrameType {
    pub fn is_control(&self) -> bool {
        *self != FrameType::Data
    }
}

/// The fixed-size header in front of every frame. Control frames consist of the header only.
///
/// ```ascii
/// 0: frame size (u16 LE) - header plus payload of this frame
/// 2: frame type (u16 LE)
/// 4: channel id (u32 LE)
/// 8: packet id (u32 LE)
/// 12: total size (u32 LE) - size of the logical packet the frame belongs to, DATA frames only
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct ProtoHeader {
    pub frame_size: u16,
    pub frame_type: u16,
    pub channel_id: u32,
    pub packet_id: u32,
    pub total_size: u32,
}

impl ProtoHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.frame_size);
        buf.put_u16_le(self.frame_type);
        buf.put_u32_le(self.channel_id);
        buf.put_u32_le(self.packet_id);
        buf.put_u32_le(self.total_size);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ProtoHeader> {
        Ok(ProtoHeader {
            frame_size: buf.try_get_u16_le()?,
            frame_type: buf.try_get_u16_le()?,
            channel_id: buf.try_get_u32_le()?,
            packet_id: buf.try_get_u32_le()?,
            total_size: buf.try_get_u32_le()?,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PROTO_HEADER_SIZE);
        self.ser(&mut buf);
        buf.freeze()
    }

    /// `None` if the header's frame type is out of range
    pub fn typ(&self) -> Option<FrameType> {
        FrameType::try_from(self.frame_type).ok()
    }

    pub fn is_valid(&self) -> bool {
        self.frame_size as usize >= PROTO_HEADER_SIZE && self.typ().is_some()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let header = ProtoHeader {
            frame_size: 0x0102,
            frame_type: FrameType::DeliveryAck.into(),
            channel_id: 0x03040506,
            packet_id: 0x0708090a,
            total_size: 0x0b0c0d0e,
        };

        let bytes = header.to_bytes();
        assert_eq!(&bytes[..], &[2,1, 6,0, 6,5,4,3, 0xa,9,8,7, 0xe,0xd,0xc,0xb]);

        let mut b: &[u8] = &bytes;
        assert_eq!(ProtoHeader::deser(&mut b).unwrap(), header);
        assert!(ProtoHeader::deser(&mut &bytes[..15]).is_err());
    }

    #[test]
    fn test_validity() {
        let mut header = ProtoHeader { frame_size: 16, frame_type: 4, ..Default::default() };
        assert!(header.is_valid());
        assert_eq!(header.typ(), Some(FrameType::Ping));

        header.frame_type = 7;
        assert!(!header.is_valid());

        header.frame_type = 0;
        header.frame_size = 15;
        assert!(!header.is_valid());
    }
}
