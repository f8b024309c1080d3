use std::io::{Read, Result, Write};

/// Read the two byte length prefix that precedes every DNS message on TCP
pub fn read_packet_length<R: Read>(stream: &mut R) -> Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer)?;

    Ok(((len_buffer[0] as u16) << 8) | (len_buffer[1] as u16))
}

pub fn write_packet_length<W: Write>(stream: &mut W, len: usize) -> Result<()> {
    let mut len_buffer = [0; 2];
    len_buffer[0] = (len >> 8) as u8;
    len_buffer[1] = (len & 0xFF) as u8;

    stream.write_all(&len_buffer)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_length_prefix() {
        let mut out = Vec::new();
        write_packet_length(&mut out, 0x1234).unwrap();
        assert_eq!(vec![0x12, 0x34], out);

        let mut cursor = Cursor::new(out);
        assert_eq!(0x1234, read_packet_length(&mut cursor).unwrap());
    }

    #[test]
    fn test_short_prefix_is_an_error() {
        let mut cursor = Cursor::new(vec![0x01]);
        assert!(read_packet_length(&mut cursor).is_err());
    }
}
