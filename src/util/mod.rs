use crc::{Crc, CRC_32_ISCSI};
use std::io::{Read, Seek, SeekFrom};

pub mod shutdown;

static CRC_INSTANCE: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

// Seek reader and read n bytes, fewer if EOF is reached first
pub fn seek_and_read_buf<R: Read + Seek>(
    reader: &mut R,
    seek: SeekFrom,
    n: usize,
) -> std::io::Result<Vec<u8>> {
    reader.seek(seek)?;
    let mut buffer = vec![0; n];

    read_exact(reader, &mut buffer)?;
    Ok(buffer)
}

// Read exact bytes(buffer.len()) from reader into buffer.
// When EOF is reached, resize buffer into bytes len that already read.
pub fn read_exact<R: Read>(reader: &mut R, buffer: &mut Vec<u8>) -> std::io::Result<()> {
    let mut last: usize = 0;
    let buffer_size = buffer.len();
    while last < buffer_size {
        match reader.read(&mut buffer[last..]) {
            Ok(0) => break,
            Ok(n) => last += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buffer.truncate(last);
    Ok(())
}

// Checksum
#[inline]
pub fn checksum(data: &[u8]) -> u32 {
    CRC_INSTANCE.checksum(data)
}

#[inline]
pub fn from_le_bytes_64(data: &[u8]) -> u64 {
    debug_assert_eq!(data.len(), 8);
    let mut buf = [0; 8];
    buf.copy_from_slice(data);
    u64::from_le_bytes(buf)
}

#[inline]
pub fn from_le_bytes_32(data: &[u8]) -> usize {
    debug_assert_eq!(data.len(), 4);
    let mut buf = [0; 4];
    buf.copy_from_slice(data);
    u32::from_le_bytes(buf) as usize
}
