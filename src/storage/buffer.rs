use bytes::{Buf, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

// Disk interaction is synchronous: the storage layer is owned by the
// single-threaded server context and every write is small and positioned.

/// Buffer is a bounded, byte-addressable region supporting positioned reads and
/// writes of primitives. Segment, meta, and snapshot files all sit on top of it.
pub trait Buffer: Send {
    /// Total writable capacity in bytes, fixed at allocation.
    fn capacity(&self) -> u64;

    /// High-water mark of bytes ever written.
    fn len(&self) -> u64;

    fn read_u8(&mut self, pos: u64) -> io::Result<u8>;
    fn read_u16(&mut self, pos: u64) -> io::Result<u16>;
    fn read_u32(&mut self, pos: u64) -> io::Result<u32>;
    fn read_u64(&mut self, pos: u64) -> io::Result<u64>;
    fn read_bytes(&mut self, pos: u64, len: usize) -> io::Result<Bytes>;

    fn write_u8(&mut self, pos: u64, value: u8) -> io::Result<()>;
    fn write_u16(&mut self, pos: u64, value: u16) -> io::Result<()>;
    fn write_u32(&mut self, pos: u64, value: u32) -> io::Result<()>;
    fn write_u64(&mut self, pos: u64, value: u64) -> io::Result<()>;
    fn write_bytes(&mut self, pos: u64, bytes: &[u8]) -> io::Result<()>;

    /// Discard everything at or past `pos`. `len()` becomes `pos`.
    fn truncate(&mut self, pos: u64) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

fn out_of_bounds(pos: u64, len: usize, capacity: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("access of {} bytes at position {} exceeds buffer capacity {}", len, pos, capacity),
    )
}

/// HeapBuffer models the disk in memory. Same contract as the file-backed buffer,
/// used by tests and by callers that want a volatile store.
pub struct HeapBuffer {
    data: Vec<u8>,
    len: u64,
    capacity: u64,
}

impl HeapBuffer {
    pub fn allocate(capacity: u64) -> Self {
        HeapBuffer {
            data: vec![0; capacity as usize],
            len: 0,
            capacity,
        }
    }

    fn check(&self, pos: u64, len: usize) -> io::Result<()> {
        if pos + len as u64 > self.capacity {
            return Err(out_of_bounds(pos, len, self.capacity));
        }
        Ok(())
    }

    fn slice(&self, pos: u64, len: usize) -> &[u8] {
        &self.data[pos as usize..pos as usize + len]
    }

    fn write_at(&mut self, pos: u64, bytes: &[u8]) -> io::Result<()> {
        self.check(pos, bytes.len())?;
        self.data[pos as usize..pos as usize + bytes.len()].copy_from_slice(bytes);
        self.len = self.len.max(pos + bytes.len() as u64);
        Ok(())
    }
}

impl Buffer for HeapBuffer {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_u8(&mut self, pos: u64) -> io::Result<u8> {
        self.check(pos, 1)?;
        Ok(self.data[pos as usize])
    }

    fn read_u16(&mut self, pos: u64) -> io::Result<u16> {
        self.check(pos, 2)?;
        Ok(self.slice(pos, 2).get_u16())
    }

    fn read_u32(&mut self, pos: u64) -> io::Result<u32> {
        self.check(pos, 4)?;
        Ok(self.slice(pos, 4).get_u32())
    }

    fn read_u64(&mut self, pos: u64) -> io::Result<u64> {
        self.check(pos, 8)?;
        Ok(self.slice(pos, 8).get_u64())
    }

    fn read_bytes(&mut self, pos: u64, len: usize) -> io::Result<Bytes> {
        self.check(pos, len)?;
        Ok(Bytes::copy_from_slice(self.slice(pos, len)))
    }

    fn write_u8(&mut self, pos: u64, value: u8) -> io::Result<()> {
        self.write_at(pos, &[value])
    }

    fn write_u16(&mut self, pos: u64, value: u16) -> io::Result<()> {
        self.write_at(pos, &value.to_be_bytes())
    }

    fn write_u32(&mut self, pos: u64, value: u32) -> io::Result<()> {
        self.write_at(pos, &value.to_be_bytes())
    }

    fn write_u64(&mut self, pos: u64, value: u64) -> io::Result<()> {
        self.write_at(pos, &value.to_be_bytes())
    }

    fn write_bytes(&mut self, pos: u64, bytes: &[u8]) -> io::Result<()> {
        self.write_at(pos, bytes)
    }

    fn truncate(&mut self, pos: u64) -> io::Result<()> {
        for byte in &mut self.data[pos as usize..self.len as usize] {
            *byte = 0;
        }
        self.len = pos;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// FileBuffer is the durable buffer: positioned reads/writes against a single
/// pre-allocated file.
pub struct FileBuffer {
    file: File,
    len: u64,
    capacity: u64,
}

impl FileBuffer {
    /// Opens (creating if needed) `path` as a buffer of `capacity` bytes. An
    /// existing file's current length is taken as the high-water mark.
    pub fn allocate<P: AsRef<Path>>(path: P, capacity: u64) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let len = file.metadata()?.len().min(capacity);

        Ok(FileBuffer { file, len, capacity })
    }

    fn check(&self, pos: u64, len: usize) -> io::Result<()> {
        if pos + len as u64 > self.capacity {
            return Err(out_of_bounds(pos, len, self.capacity));
        }
        Ok(())
    }

    fn read_exact_at(&mut self, pos: u64, out: &mut [u8]) -> io::Result<()> {
        self.check(pos, out.len())?;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(out)
    }

    fn write_all_at(&mut self, pos: u64, bytes: &[u8]) -> io::Result<()> {
        self.check(pos, bytes.len())?;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(bytes)?;
        self.len = self.len.max(pos + bytes.len() as u64);
        Ok(())
    }
}

impl Buffer for FileBuffer {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_u8(&mut self, pos: u64) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_at(pos, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self, pos: u64) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact_at(pos, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32(&mut self, pos: u64) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact_at(pos, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self, pos: u64) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact_at(pos, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_bytes(&mut self, pos: u64, len: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(len);
        buf.resize(len, 0);
        self.read_exact_at(pos, &mut buf)?;
        Ok(buf.freeze())
    }

    fn write_u8(&mut self, pos: u64, value: u8) -> io::Result<()> {
        self.write_all_at(pos, &[value])
    }

    fn write_u16(&mut self, pos: u64, value: u16) -> io::Result<()> {
        self.write_all_at(pos, &value.to_be_bytes())
    }

    fn write_u32(&mut self, pos: u64, value: u32) -> io::Result<()> {
        self.write_all_at(pos, &value.to_be_bytes())
    }

    fn write_u64(&mut self, pos: u64, value: u64) -> io::Result<()> {
        self.write_all_at(pos, &value.to_be_bytes())
    }

    fn write_bytes(&mut self, pos: u64, bytes: &[u8]) -> io::Result<()> {
        self.write_all_at(pos, bytes)
    }

    fn truncate(&mut self, pos: u64) -> io::Result<()> {
        self.file.set_len(pos)?;
        self.len = pos;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}
