use std::cmp::min;
use bytes::Bytes;
use tracing::{trace, warn};
use crate::proto::proto_header::{FrameType, ProtoHeader, PROTO_HEADER_SIZE, PROTO_MAX_FRAME_DATA_SIZE, PROTO_MAX_FRAME_SIZE};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DecodeStatus {
    /// a complete logical packet or control frame was decoded into the result
    Ok,
    /// all of the input was consumed without completing a packet
    Incomplete,
    /// The stream is corrupt. There is no resynchronization, the connection must be dropped.
    Invalid,
}

#[derive(Debug, Clone, Default)]
pub struct DecodeResult {
    /// Number of input bytes consumed by the call, whatever its status. The caller advances its
    ///  read position by exactly this and calls `decode` again for the rest.
    pub decoded_size: usize,
    pub frame_type: Option<FrameType>,
    pub channel_id: u32,
    pub packet_id: u32,
    /// the reassembled packet for DATA, empty for control frames
    pub data: Bytes,
}

/// Incremental decoder for one connection's byte stream.
///
/// Bytes are gathered into a frame buffer until a complete frame is present. DATA frames are
///  fragments of a logical packet of `total_size` bytes, and their payloads are accumulated
///  until the packet is complete. Control frames are self-contained.
pub struct ProtoDecoder {
    cur_frame: Box<[u8; PROTO_MAX_FRAME_SIZE]>,
    cur_frame_size: usize,
    accum: Vec<u8>,
    total_data_size: usize,
    accumulated_size: usize,
}

impl Default for ProtoDecoder {
    fn default() -> Self {
        ProtoDecoder::new()
    }
}

impl ProtoDecoder {
    pub fn new() -> ProtoDecoder {
        ProtoDecoder {
            cur_frame: Box::new([0; PROTO_MAX_FRAME_SIZE]),
            cur_frame_size: 0,
            accum: Vec::new(),
            total_data_size: 0,
            accumulated_size: 0,
        }
    }

    pub fn decode(&mut self, buf: &[u8], result: &mut DecodeResult) -> DecodeStatus {
        *result = DecodeResult::default();

        let mut consumed = 0;
        if self.cur_frame_size < PROTO_HEADER_SIZE {
            consumed = self.gather(buf, PROTO_HEADER_SIZE);
            if self.cur_frame_size < PROTO_HEADER_SIZE {
                result.decoded_size = consumed;
                return DecodeStatus::Incomplete;
            }
        }

        let header = self.cur_header();
        if !header.is_valid() {
            warn!("invalid frame header {:?}", header);
            result.decoded_size = consumed;
            return DecodeStatus::Invalid;
        }

        let frame_size: usize = header.frame_size.safe_cast();
        consumed += self.gather(&buf[consumed..], frame_size);
        result.decoded_size = consumed;
        if self.cur_frame_size < frame_size {
            return DecodeStatus::Incomplete;
        }
        self.cur_frame_size = 0;

        let Some(frame_type) = header.typ() else {
            return DecodeStatus::Invalid;
        };
        trace!("decoded {:?} frame: channel {}, packet {}, {} bytes", frame_type, header.channel_id, header.packet_id, frame_size);

        if frame_type.is_control() {
            result.frame_type = Some(frame_type);
            result.channel_id = header.channel_id;
            result.packet_id = header.packet_id;
            return DecodeStatus::Ok;
        }

        if self.total_data_size == 0 {
            if header.total_size == 0 {
                warn!("data frame for an empty packet");
                return DecodeStatus::Invalid;
            }
            self.total_data_size = header.total_size.safe_cast();
            self.accumulated_size = 0;
            self.accum.clear();
            // total_size is untrusted, the buffer grows with the fragments that actually arrive
            self.accum.reserve(min(self.total_data_size, PROTO_MAX_FRAME_DATA_SIZE));
        }

        let fragment = &self.cur_frame[PROTO_HEADER_SIZE..frame_size];
        if self.accumulated_size + fragment.len() > self.total_data_size {
            warn!("data frame exceeds its packet's total size of {}", self.total_data_size);
            return DecodeStatus::Invalid;
        }
        self.accum.extend_from_slice(fragment);
        self.accumulated_size += fragment.len();

        if self.accumulated_size < self.total_data_size {
            return DecodeStatus::Incomplete;
        }

        result.frame_type = Some(FrameType::Data);
        result.channel_id = header.channel_id;
        result.packet_id = header.packet_id;
        result.data = Bytes::from(std::mem::take(&mut self.accum));
        self.total_data_size = 0;
        self.accumulated_size = 0;
        DecodeStatus::Ok
    }

    /// copies from `buf` until the frame buffer holds `target` bytes, returning the number of bytes copied
    fn gather(&mut self, buf: &[u8], target: usize) -> usize {
        let n = min(target - self.cur_frame_size, buf.len());
        self.cur_frame[self.cur_frame_size..self.cur_frame_size + n].copy_from_slice(&buf[..n]);
        self.cur_frame_size += n;
        n
    }

    fn cur_header(&self) -> ProtoHeader {
        let mut b: &[u8] = &self.cur_frame[..PROTO_HEADER_SIZE];
        ProtoHeader::deser(&mut b)
            .expect("frame buffer holds a complete header")
    }

    /// Fills `header` for the next frame of a packet of `total_size` bytes of which `sent_size`
    ///  were already sent, returning the number of payload bytes that go into this frame.
    pub fn encode_data_frame(header: &mut ProtoHeader, channel_id: u32, packet_id: u32, total_size: usize, sent_size: usize) -> usize {
        debug_assert!(sent_size < total_size);
        let chunk = min(total_size - sent_size, PROTO_MAX_FRAME_DATA_SIZE);

        *header = ProtoHeader {
            frame_size: (PROTO_HEADER_SIZE + chunk).prechecked_cast(),
            frame_type: FrameType::Data.into(),
            channel_id,
            packet_id,
            total_size: total_size.prechecked_cast(),
        };
        chunk
    }

    pub fn encode_control_frame(header: &mut ProtoHeader, frame_type: FrameType, channel_id: u32, packet_id: u32) {
        debug_assert!(frame_type.is_control());
        *header = ProtoHeader {
            frame_size: PROTO_HEADER_SIZE.prechecked_cast(),
            frame_type: frame_type.into(),
            channel_id,
            packet_id,
            total_size: 0,
        };
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use rstest::rstest;

    fn encode_packet(channel_id: u32, packet_id: u32, data: &[u8], out: &mut Vec<u8>) -> usize {
        let mut sent = 0;
        let mut num_frames = 0;
        while sent < data.len() {
            let mut header = ProtoHeader::default();
            let chunk = ProtoDecoder::encode_data_frame(&mut header, channel_id, packet_id, data.len(), sent);
            header.ser(out);
            out.put_slice(&data[sent..sent+chunk]);
            sent += chunk;
            num_frames += 1;
        }
        num_frames
    }

    fn encode_control(frame_type: FrameType, channel_id: u32, packet_id: u32, out: &mut Vec<u8>) {
        let mut header = ProtoHeader::default();
        ProtoDecoder::encode_control_frame(&mut header, frame_type, channel_id, packet_id);
        header.ser(out);
    }

    #[derive(Debug, PartialEq)]
    struct Decoded {
        frame_type: FrameType,
        channel_id: u32,
        packet_id: u32,
        data: Vec<u8>,
    }

    fn decode_all(stream: &[u8], chunk_size: usize) -> Vec<Decoded> {
        let mut decoder = ProtoDecoder::new();
        let mut decoded = Vec::new();

        for chunk in stream.chunks(chunk_size) {
            let mut pos = 0;
            while pos < chunk.len() {
                let mut result = DecodeResult::default();
                let status = decoder.decode(&chunk[pos..], &mut result);
                assert!(result.decoded_size > 0);
                pos += result.decoded_size;

                match status {
                    DecodeStatus::Ok => decoded.push(Decoded {
                        frame_type: result.frame_type.unwrap(),
                        channel_id: result.channel_id,
                        packet_id: result.packet_id,
                        data: result.data.to_vec(),
                    }),
                    DecodeStatus::Incomplete => {}
                    DecodeStatus::Invalid => panic!("invalid stream"),
                }
            }
        }
        decoded
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[rstest]
    #[case::one_byte(1, 1)]
    #[case::max_single_frame(PROTO_MAX_FRAME_DATA_SIZE, 1)]
    #[case::just_over_one_frame(PROTO_MAX_FRAME_DATA_SIZE + 1, 2)]
    #[case::several_frames(3*PROTO_MAX_FRAME_DATA_SIZE + 17, 4)]
    fn test_frame_count(#[case] len: usize, #[case] expected_frames: usize) {
        let mut stream = Vec::new();
        assert_eq!(encode_packet(1, 2, &payload(len), &mut stream), expected_frames);
        assert_eq!(stream.len(), len + expected_frames * PROTO_HEADER_SIZE);
    }

    #[rstest]
    #[case::single_call(usize::MAX)]
    #[case::one_byte_at_a_time(1)]
    #[case::partial_header(7)]
    #[case::header_size(PROTO_HEADER_SIZE)]
    #[case::odd(1001)]
    #[case::frame_size(PROTO_MAX_FRAME_SIZE)]
    #[case::frame_size_plus_one(PROTO_MAX_FRAME_SIZE + 1)]
    fn test_chunking_invariance(#[case] chunk_size: usize) {
        let mut stream = Vec::new();
        encode_control(FrameType::ChannelQuery, 5, 0, &mut stream);
        encode_packet(5, 100, &payload(10), &mut stream);
        encode_control(FrameType::Ping, 0, 0, &mut stream);
        encode_packet(5, 101, &payload(2*PROTO_MAX_FRAME_DATA_SIZE + 3), &mut stream);
        encode_control(FrameType::DeliveryAck, 5, 100, &mut stream);
        encode_packet(7, 102, &payload(1), &mut stream);

        let decoded = decode_all(&stream, chunk_size);

        assert_eq!(decoded, vec![
            Decoded { frame_type: FrameType::ChannelQuery, channel_id: 5, packet_id: 0, data: vec![] },
            Decoded { frame_type: FrameType::Data, channel_id: 5, packet_id: 100, data: payload(10) },
            Decoded { frame_type: FrameType::Ping, channel_id: 0, packet_id: 0, data: vec![] },
            Decoded { frame_type: FrameType::Data, channel_id: 5, packet_id: 101, data: payload(2*PROTO_MAX_FRAME_DATA_SIZE + 3) },
            Decoded { frame_type: FrameType::DeliveryAck, channel_id: 5, packet_id: 100, data: vec![] },
            Decoded { frame_type: FrameType::Data, channel_id: 7, packet_id: 102, data: payload(1) },
        ]);
    }

    #[test]
    fn test_control_frame_in_single_call() {
        let mut stream = Vec::new();
        encode_control(FrameType::Ping, 0, 0, &mut stream);
        encode_control(FrameType::Pong, 0, 0, &mut stream);

        let mut decoder = ProtoDecoder::new();
        let mut result = DecodeResult::default();
        assert_eq!(decoder.decode(&stream, &mut result), DecodeStatus::Ok);
        assert_eq!(result.decoded_size, PROTO_HEADER_SIZE);
        assert_eq!(result.frame_type, Some(FrameType::Ping));
        assert!(result.data.is_empty());

        assert_eq!(decoder.decode(&stream[PROTO_HEADER_SIZE..], &mut result), DecodeStatus::Ok);
        assert_eq!(result.decoded_size, PROTO_HEADER_SIZE);
        assert_eq!(result.frame_type, Some(FrameType::Pong));
    }

    #[test]
    fn test_packet_boundary_inside_one_read() {
        let mut stream = Vec::new();
        encode_packet(1, 1, b"abc", &mut stream);
        encode_packet(1, 2, b"defg", &mut stream);

        let mut decoder = ProtoDecoder::new();
        let mut result = DecodeResult::default();
        assert_eq!(decoder.decode(&stream, &mut result), DecodeStatus::Ok);
        assert_eq!(result.decoded_size, PROTO_HEADER_SIZE + 3);
        assert_eq!(&result.data[..], b"abc");

        assert_eq!(decoder.decode(&stream[result.decoded_size..], &mut result), DecodeStatus::Ok);
        assert_eq!(&result.data[..], b"defg");
        assert_eq!(result.packet_id, 2);
    }

    #[rstest]
    #[case::frame_size_too_small(ProtoHeader { frame_size: 15, frame_type: 4, ..Default::default() })]
    #[case::frame_size_zero(ProtoHeader { frame_size: 0, frame_type: 0, ..Default::default() })]
    #[case::frame_type_too_big(ProtoHeader { frame_size: 16, frame_type: 7, ..Default::default() })]
    #[case::frame_type_max(ProtoHeader { frame_size: 16, frame_type: u16::MAX, ..Default::default() })]
    #[case::empty_packet(ProtoHeader { frame_size: 16, frame_type: 0, total_size: 0, ..Default::default() })]
    #[case::fragment_exceeds_total(ProtoHeader { frame_size: 20, frame_type: 0, total_size: 3, ..Default::default() })]
    fn test_invalid_header(#[case] header: ProtoHeader) {
        let mut stream = Vec::new();
        header.ser(&mut stream);
        stream.extend_from_slice(&[0u8; 8]);

        let mut decoder = ProtoDecoder::new();
        let mut result = DecodeResult::default();
        assert_eq!(decoder.decode(&stream, &mut result), DecodeStatus::Invalid);
        assert!(result.decoded_size <= stream.len());
    }

    #[test]
    fn test_incomplete_reports_consumed_bytes() {
        let mut stream = Vec::new();
        encode_packet(3, 4, &payload(100), &mut stream);

        let mut decoder = ProtoDecoder::new();
        let mut result = DecodeResult::default();
        assert_eq!(decoder.decode(&stream[..10], &mut result), DecodeStatus::Incomplete);
        assert_eq!(result.decoded_size, 10);
        assert_eq!(decoder.decode(&stream[10..50], &mut result), DecodeStatus::Incomplete);
        assert_eq!(result.decoded_size, 40);
        assert_eq!(decoder.decode(&stream[50..], &mut result), DecodeStatus::Ok);
        assert_eq!(result.decoded_size, stream.len() - 50);
        assert_eq!(result.data.to_vec(), payload(100));
    }

    #[test]
    fn test_huge_total_size_does_not_preallocate() {
        let mut stream = Vec::new();
        ProtoHeader { frame_size: 17, frame_type: 0, channel_id: 1, packet_id: 1, total_size: u32::MAX }.ser(&mut stream);
        stream.put_u8(42);

        let mut decoder = ProtoDecoder::new();
        let mut result = DecodeResult::default();
        assert_eq!(decoder.decode(&stream, &mut result), DecodeStatus::Incomplete);
        assert_eq!(result.decoded_size, 17);
        assert!(decoder.accum.capacity() <= PROTO_MAX_FRAME_DATA_SIZE);
        assert_eq!(decoder.accum, vec![42]);
    }
}
