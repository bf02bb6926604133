// src/processing/chunk_buffer.rs
use std::io;

/// Row-aware byte accumulator.
///
/// Bytes land in fixed-capacity chunks; a new chunk is started only when the
/// current one is full and more bytes arrive, so the last chunk always holds
/// at least one byte once anything has been written. Rows are counted by the
/// caller through [`ChunkBuffer::mark_row`].
#[derive(Debug)]
pub struct ChunkBuffer {
    chunk_size: usize,
    delimiter: Option<u8>,
    chunks: Vec<Vec<u8>>,
    rows: usize,
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize, delimiter: Option<u8>) -> Self {
        assert!(chunk_size > 0, "chunk_size must be non-zero");
        Self {
            chunk_size,
            delimiter,
            chunks: Vec::new(),
            rows: 0,
        }
    }

    pub fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let needs_chunk = self
                .chunks
                .last()
                .map_or(true, |chunk| chunk.len() == self.chunk_size);
            if needs_chunk {
                self.chunks.push(Vec::with_capacity(self.chunk_size));
            }

            let chunk_size = self.chunk_size;
            if let Some(current) = self.chunks.last_mut() {
                let take = (chunk_size - current.len()).min(bytes.len());
                current.extend_from_slice(&bytes[..take]);
                bytes = &bytes[take..];
            }
        }
    }

    /// Record one row boundary and return the number of rows now buffered.
    pub fn mark_row(&mut self) -> usize {
        self.rows += 1;
        self.rows
    }

    /// Used length of the last chunk, i.e. the write cursor.
    pub fn offset(&self) -> usize {
        self.chunks.last().map_or(0, Vec::len)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 && self.chunks.is_empty()
    }

    /// Drain every chunk into one payload and reset the row count.
    ///
    /// A single trailing delimiter right before the write cursor is dropped.
    pub fn take_payload(&mut self) -> Vec<u8> {
        let mut chunks = std::mem::take(&mut self.chunks);
        self.rows = 0;

        let Some(mut last) = chunks.pop() else {
            return Vec::new();
        };
        if self.delimiter.is_some() && last.last().copied() == self.delimiter {
            last.pop();
        }

        let mut payload = Vec::with_capacity(chunks.len() * self.chunk_size + last.len());
        for chunk in &chunks {
            payload.extend_from_slice(chunk);
        }
        payload.extend_from_slice(&last);
        payload
    }
}

impl io::Write for ChunkBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ChunkBuffer::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
