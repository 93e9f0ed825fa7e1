//! Seekable byte stream over one LUN
//!
//! Maps byte positions onto READ(10)/WRITE(10) block commands. Writes that
//! cover part of a block read that block first and write it back whole.

use crate::error::{IscsiError, ScsiResult};
use crate::session::Session;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// `Read + Write + Seek` adapter for a block-storage LUN
pub struct DiskStream<'a, S: Read + Write> {
    session: &'a mut Session<S>,
    lun: u64,
    block_size: u64,
    length: u64,
    position: u64,
}

impl<'a, S: Read + Write> DiskStream<'a, S> {
    /// Query the LUN's capacity and position the stream at offset 0
    pub fn new(session: &'a mut Session<S>, lun: u64) -> ScsiResult<Self> {
        let capacity = session.get_capacity(lun)?;
        if capacity.block_size == 0 {
            return Err(IscsiError::Protocol(format!(
                "LUN {} reported a block size of zero",
                lun
            )));
        }

        Ok(DiskStream {
            session,
            lun,
            block_size: capacity.block_size as u64,
            length: capacity.size_bytes(),
            position: 0,
        })
    }

    /// Total size in bytes
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn block_size(&self) -> u32 {
        self.block_size as u32
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn read_block(&mut self, block: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize];
        let read = self.session.read(self.lun, block, 1, &mut buf)?;
        if read != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Incomplete read, received {} bytes from 1 block", read),
            ));
        }
        Ok(buf)
    }
}

impl<S: Read + Write> Read for DiskStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length || buf.is_empty() {
            return Ok(0);
        }

        let wanted = (self.length - self.position).min(buf.len() as u64);
        let first_block = self.position / self.block_size;
        let last_block = (self.position + wanted + self.block_size - 1) / self.block_size;
        let block_count = (last_block - first_block).min(u16::MAX as u64);

        let mut temp = vec![0u8; (block_count * self.block_size) as usize];
        let read = self
            .session
            .read(self.lun, first_block, block_count as u16, &mut temp)?
            .min(temp.len());

        let skip = (self.position - first_block * self.block_size) as usize;
        let copied = (wanted as usize).min(read.saturating_sub(skip));
        buf[..copied].copy_from_slice(&temp[skip..skip + copied]);

        self.position += copied as u64;
        Ok(copied)
    }
}

impl<S: Read + Write> Write for DiskStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.position + buf.len() as u64 > self.length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Attempt to write beyond end of stream",
            ));
        }

        let block_size = self.block_size as usize;
        let mut written = 0;
        while written < buf.len() {
            let block = self.position / self.block_size;
            let offset_in_block = (self.position % self.block_size) as usize;
            let remaining = buf.len() - written;

            let count = if offset_in_block != 0 || remaining < block_size {
                let count = remaining.min(block_size - offset_in_block);
                let mut block_buf = self.read_block(block)?;
                block_buf[offset_in_block..offset_in_block + count]
                    .copy_from_slice(&buf[written..written + count]);
                self.session
                    .write(self.lun, block, 1, self.block_size as u32, &block_buf)?;
                count
            } else {
                let blocks = (remaining / block_size).min(u16::MAX as usize);
                let count = blocks * block_size;
                self.session.write(
                    self.lun,
                    block,
                    blocks as u16,
                    self.block_size as u32,
                    &buf[written..written + count],
                )?;
                count
            };

            written += count;
            self.position += count as u64;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Read + Write> Seek for DiskStream<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
        };

        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Attempt to move before beginning of disk",
            )),
        }
    }
}
