//! Owned byte regions with headroom/tailroom (spec §4.A). Two buffer shapes live
//! here:
//!
//! - [`Buffer`]: a dynamically sized double-ended FIFO byte queue, used for the
//!   TCP stream read/write buffers (spec §4.I). Kept close to the teacher's
//!   `neutronium::net::buffer::Buffer`.
//! - [`PacketBuffer`]: a fixed-capacity single-packet buffer with explicit headroom,
//!   used on the steady-state per-packet path (spec §4.A's "all packet-processing
//!   stages are required to operate in-place ... no allocation per packet"). Every
//!   encapsulation layer (crypto, fragment, opcode, proxy) prepends its header by
//!   writing into the reserved headroom rather than reallocating.

use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

const BUF_SIZE_INCREMENT: usize = 65536;

/// A dynamically sized, double-ended, buffered FIFO byte queue. Data is appended at
/// the tail and read from the head.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "Buffer size must be divisible by {}, got {}",
                BUF_SIZE_INCREMENT, size
            );
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    /// Writes the contents of the buffer to the supplied writer, advancing the read
    /// offset.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while self.data.len() > 0 {
            let write_count = writer.write(&self.data)?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Reads in data from the supplied reader to the buffer.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let orig_capacity = self.free_capacity();

        while self.data.len() < self.size {
            unsafe {
                let read_count = reader.read(self.data.tail_head_slice())?;

                if read_count == 0 {
                    return Ok(orig_capacity - self.free_capacity());
                }

                self.move_tail(read_count);
            }
        }

        Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"))
    }

    #[allow(dead_code)]
    #[inline]
    pub(crate) fn data_slice(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}

/// A fixed-capacity single-packet buffer with explicit headroom, as described in spec
/// §4.A: `{ capacity, headroom_offset, length }` with `0 <= offset <= offset+length <=
/// capacity`.
pub struct PacketBuffer {
    data: Vec<u8>,
    offset: usize,
    length: usize,
}

impl PacketBuffer {
    /// Allocates a new buffer of `capacity` bytes with `headroom` bytes reserved at
    /// the front for later prepends.
    pub fn with_headroom(capacity: usize, headroom: usize) -> PacketBuffer {
        assert!(headroom <= capacity, "headroom cannot exceed capacity");
        PacketBuffer {
            data: vec![0u8; capacity],
            offset: headroom,
            length: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    pub fn headroom(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn tailroom(&self) -> usize {
        self.data.len() - self.offset - self.length
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.length]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..self.offset + self.length]
    }

    /// Resets the buffer to empty, preserving its original headroom.
    pub fn clear(&mut self, headroom: usize) {
        self.offset = headroom;
        self.length = 0;
    }

    /// Loads `content` into the payload region, replacing whatever was there.
    pub fn set_payload(&mut self, content: &[u8]) -> Result<(), ()> {
        if content.len() > self.tailroom() + self.length {
            return Err(());
        }
        self.length = content.len();
        self.as_mut_slice().copy_from_slice(content);
        Ok(())
    }

    /// Prepends `header` bytes in front of the current payload, consuming headroom.
    /// Fails if there isn't enough headroom left (spec §4.A: "fails if `offset < N`").
    pub fn prepend(&mut self, header: &[u8]) -> Result<(), ()> {
        if header.len() > self.offset {
            return Err(());
        }
        self.offset -= header.len();
        self.length += header.len();
        self.as_mut_slice()[..header.len()].copy_from_slice(header);
        Ok(())
    }

    /// Appends `tail` bytes after the current payload, consuming tailroom. Fails if
    /// `offset+length+N > capacity`.
    pub fn append(&mut self, tail: &[u8]) -> Result<(), ()> {
        if tail.len() > self.tailroom() {
            return Err(());
        }
        let start = self.offset + self.length;
        self.data[start..start + tail.len()].copy_from_slice(tail);
        self.length += tail.len();
        Ok(())
    }

    /// Consumes `count` bytes from the front of the payload (e.g. after parsing a
    /// header), returning them.
    pub fn advance(&mut self, count: usize) -> Result<(), ()> {
        if count > self.length {
            return Err(());
        }
        self.offset += count;
        self.length -= count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        pub fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT / 2).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let result = buffer.ingress(&mut channel);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.data.len(), mock_data.len());
        assert_eq!(buffer.data.as_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.data.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        buffer.data.push_back(1);

        let result = buffer.egress(&mut zero_vec[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_ingress_buffer_overrun() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT * 2).map(|item| item as u8).collect();
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let result = buffer.ingress(&mock_data[..]);

        assert!(result.is_err());
        let err = result.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    #[should_panic(expected = "Buffer size must be divisible by 65536, got 100000")]
    fn test_fail_on_incorrect_increment() {
        let _ = Buffer::new(100000);
    }

    #[test]
    fn test_cursor_roundtrip() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        buffer.ingress(&mut cursor).unwrap();
        assert_eq!(buffer.data.as_slice(), &[1, 2, 3]);

        let mut out = Cursor::new(Vec::<u8>::new());
        buffer.egress(&mut out).unwrap();
        assert_eq!(&out.get_ref()[..], &[1, 2, 3]);
    }

    #[test]
    fn test_packet_buffer_prepend_and_append() {
        let mut buf = PacketBuffer::with_headroom(64, 16);
        buf.set_payload(b"payload").unwrap();

        buf.prepend(b"HDR").unwrap();
        buf.append(b"TAIL").unwrap();

        assert_eq!(buf.as_slice(), b"HDRpayloadTAIL");
        assert_eq!(buf.headroom(), 13);
    }

    #[test]
    fn test_packet_buffer_prepend_fails_past_headroom() {
        let mut buf = PacketBuffer::with_headroom(32, 4);
        buf.set_payload(b"xy").unwrap();

        assert!(buf.prepend(b"way too big for headroom").is_err());
    }

    #[test]
    fn test_packet_buffer_append_fails_past_capacity() {
        let mut buf = PacketBuffer::with_headroom(8, 0);
        buf.set_payload(b"123456").unwrap();

        assert!(buf.append(b"xyz").is_err());
        assert!(buf.append(b"xy").is_ok());
    }

    #[test]
    fn test_packet_buffer_advance_consumes_front() {
        let mut buf = PacketBuffer::with_headroom(32, 8);
        buf.set_payload(b"header-body").unwrap();

        buf.advance(7).unwrap();
        assert_eq!(buf.as_slice(), b"body");
        assert!(buf.advance(100).is_err());
    }
}
