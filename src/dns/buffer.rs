//! buffers for use when writing and reading dns packets

use std::collections::BTreeMap;
use std::io::Read;

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    Io(std::io::Error),
    EndOfBuffer,
    LabelTooLong,
    TooManyJumps,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Upper bound on compression pointers followed while reading a single name
const MAX_JUMPS: usize = 5;

pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;
    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    /// Write a domain name, compressing it against labels written earlier in
    /// the same buffer where the buffer keeps a label index.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let qname = qname.trim_end_matches('.');
        if qname.is_empty() {
            return self.write_u8(0);
        }

        let split_str = qname.split('.').collect::<Vec<&str>>();

        let mut jump_performed = false;
        for (i, label) in split_str.iter().enumerate() {
            let search_lbl = split_str[i..split_str.len()].join(".");
            if let Some(prev_pos) = self.find_label(&search_lbl) {
                let jump_inst = (prev_pos as u16) | 0xC000;
                self.write_u16(jump_inst)?;
                jump_performed = true;

                break;
            }

            let pos = self.pos();
            // pointers only reach the first 14 bits of the message
            if pos < 0x3FFF {
                self.save_label(&search_lbl, pos);
            }

            let len = label.len();
            if len > 0x3F {
                return Err(BufferError::LabelTooLong);
            }

            self.write_u8(len as u8)?;
            for b in label.as_bytes() {
                self.write_u8(*b)?;
            }
        }

        if !jump_performed {
            self.write_u8(0)?;
        }

        Ok(())
    }

    /// Write `data` as one or more DNS character-strings of at most 255 bytes
    fn write_character_strings(&mut self, data: &str) -> Result<()> {
        let bytes = data.as_bytes();
        if bytes.is_empty() {
            return self.write_u8(0);
        }

        for chunk in bytes.chunks(0xFF) {
            self.write_u8(chunk.len() as u8)?;
            for b in chunk {
                self.write_u8(*b)?;
            }
        }

        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);

        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);

        Ok(res)
    }

    /// Read a domain name, following compression pointers.
    ///
    /// The position of the buffer ends up right after the name as it appears
    /// at the starting position, regardless of any jumps.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut jumps = 0;

        let mut delim = "";
        loop {
            let len = self.get(pos)?;

            // Two high bits set means a pointer to a previous name
            if (len & 0xC0) == 0xC0 {
                if jumps >= MAX_JUMPS {
                    return Err(BufferError::TooManyJumps);
                }

                if !jumped {
                    self.seek(pos + 2)?;
                }

                let b2 = self.get(pos + 1)? as u16;
                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;
                jumped = true;
                jumps += 1;
                continue;
            }

            pos += 1;

            if len == 0 {
                break;
            }

            outstr.push_str(delim);

            let str_buffer = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(str_buffer).to_lowercase());

            delim = ".";

            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

/// A growable buffer, used for building outgoing packets
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub label_lookup: BTreeMap<String, usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }

    fn read(&mut self) -> Result<u8> {
        let res = *self.buffer.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buffer.get(pos).cloned().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        self.buffer
            .get(start..start + len)
            .ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos < self.buffer.len() {
            self.buffer[self.pos] = val;
        } else {
            self.buffer.push(val);
        }
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        let slot = self.buffer.get_mut(pos).ok_or(BufferError::EndOfBuffer)?;
        *slot = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}

/// A buffer reading lazily from a stream, used for TCP transport
pub struct StreamPacketBuffer<'a, T>
where
    T: Read,
{
    pub stream: &'a mut T,
    pub buffer: Vec<u8>,
    pub pos: usize,
}

impl<'a, T> StreamPacketBuffer<'a, T>
where
    T: Read + 'a,
{
    pub fn new(stream: &'a mut T) -> StreamPacketBuffer<'a, T> {
        StreamPacketBuffer {
            stream,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    fn fill_to(&mut self, len: usize) -> Result<()> {
        while self.buffer.len() < len {
            let mut local_buffer = [0; 1];
            self.stream.read_exact(&mut local_buffer)?;
            self.buffer.push(local_buffer[0]);
        }

        Ok(())
    }
}

impl<'a, T> PacketBuffer for StreamPacketBuffer<'a, T>
where
    T: Read + 'a,
{
    fn find_label(&self, _: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _: &str, _: usize) {}

    fn read(&mut self) -> Result<u8> {
        self.fill_to(self.pos + 1)?;
        let res = self.buffer[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.fill_to(pos + 1)?;

        Ok(self.buffer[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        self.fill_to(start + len)?;

        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, _: u8) -> Result<()> {
        Ok(())
    }

    fn set(&mut self, _: usize, _: u8) -> Result<()> {
        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}

/// A fixed size buffer matching the classic 512 byte UDP payload
pub struct BytePacketBuffer {
    pub buf: [u8; 512],
    pub pos: usize,
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        BytePacketBuffer::new()
    }
}

impl BytePacketBuffer {
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; 512],
            pos: 0,
        }
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn find_label(&self, _: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _: &str, _: usize) {}

    fn read(&mut self) -> Result<u8> {
        if self.pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }

        Ok(self.buf[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > 512 {
            return Err(BufferError::EndOfBuffer);
        }

        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[self.pos] = val;
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_qname() {
        let mut buffer = VectorPacketBuffer::new();

        let instr1 = "a.google.com".to_string();
        let instr2 = "b.google.com".to_string();

        // First write the standard string
        match buffer.write_qname(&instr1) {
            Ok(_) => {}
            Err(_) => panic!(),
        }

        // Then we set up a slight variation with relies on a jump back to the data of
        // the first name
        let crafted_data = [0x01, b'b', 0xC0, 0x02];
        for b in &crafted_data {
            match buffer.write_u8(*b) {
                Ok(_) => {}
                Err(_) => panic!(),
            }
        }

        // Reset the buffer position for reading
        buffer.pos = 0;

        // Read the standard name
        let mut outstr1 = String::new();
        match buffer.read_qname(&mut outstr1) {
            Ok(_) => {}
            Err(_) => panic!(),
        }

        assert_eq!(instr1, outstr1);

        // Read the name with a jump
        let mut outstr2 = String::new();
        match buffer.read_qname(&mut outstr2) {
            Ok(_) => {}
            Err(_) => panic!(),
        }

        assert_eq!(instr2, outstr2);

        // Make sure we're now at the end of the buffer
        assert_eq!(buffer.pos, buffer.buffer.len());
    }

    #[test]
    fn test_qname_compression_reuses_suffix() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("_pds-verify.example.com").unwrap();
        let first_len = buffer.pos();
        buffer.write_qname("example.com").unwrap();

        // the second name is a bare pointer into the first one
        assert_eq!(buffer.pos() - first_len, 2);

        buffer.pos = first_len;
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!("example.com", name);
    }

    #[test]
    fn test_pointer_loop_is_rejected() {
        let mut buffer = VectorPacketBuffer::new();
        // a pointer pointing at itself
        buffer.write_u16(0xC000).unwrap();
        buffer.pos = 0;

        let mut name = String::new();
        assert!(buffer.read_qname(&mut name).is_err());
    }

    #[test]
    fn test_label_too_long() {
        let mut buffer = VectorPacketBuffer::new();
        let label = "a".repeat(64);
        assert!(buffer.write_qname(&format!("{}.com", label)).is_err());
    }

    #[test]
    fn test_character_strings_are_chunked() {
        let mut buffer = VectorPacketBuffer::new();
        let data = "x".repeat(300);
        buffer.write_character_strings(&data).unwrap();

        assert_eq!(buffer.buffer.len(), 302);
        assert_eq!(buffer.buffer[0], 255);
        assert_eq!(buffer.buffer[256], 45);
    }

    #[test]
    fn test_byte_buffer_bounds() {
        let mut buffer = BytePacketBuffer::new();
        buffer.seek(511).unwrap();
        assert!(buffer.write_u8(1).is_ok());
        assert!(buffer.write_u8(1).is_err());
        assert!(buffer.get_range(500, 20).is_err());
    }
}
