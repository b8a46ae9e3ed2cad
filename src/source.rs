//! Chunked payload sources for characteristic writes.
//!
//! A write command pulls its payload from an [`InputSource`] one chunk at a
//! time, waiting for the platform write acknowledgement between chunks.
//! Sources whose `next_chunk` may block (network reads, channels fed by
//! other threads) report `is_blocking() == true` and are pulled on a
//! dedicated blocking task instead of the command's own task.

use std::io;
use std::sync::mpsc;

/// Default number of bytes per characteristic write. Derived from the
/// minimum ATT MTU of 23 minus the 3-byte write header.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// A pull-based source of write payload chunks.
pub trait InputSource: Send {
    /// Prepare the source for a fresh run. Called once per write attempt;
    /// a retried operation re-opens the source from the start.
    fn open(&mut self) -> io::Result<()>;

    /// The next chunk to write, or `None` when the payload is exhausted.
    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Release whatever the source holds. Called on success, error and
    /// cancellation alike.
    fn close(&mut self);

    /// Whether `next_chunk` may block the calling thread.
    fn is_blocking(&self) -> bool {
        false
    }
}

/// An in-memory byte payload, split into [`DEFAULT_CHUNK_SIZE`] chunks.
pub struct BytesInputSource {
    data: Vec<u8>,
    offset: usize,
    opened: bool,
}

impl BytesInputSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            offset: 0,
            opened: false,
        }
    }
}

impl InputSource for BytesInputSource {
    fn open(&mut self) -> io::Result<()> {
        self.offset = 0;
        self.opened = true;
        Ok(())
    }

    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if !self.opened || self.offset >= self.data.len() {
            return Ok(None);
        }
        let end = (self.offset + DEFAULT_CHUNK_SIZE).min(self.data.len());
        let chunk = self.data[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(chunk))
    }

    fn close(&mut self) {
        self.opened = false;
        self.offset = 0;
    }
}

/// A UTF-8 string payload.
pub struct StringInputSource {
    inner: BytesInputSource,
}

impl StringInputSource {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: BytesInputSource::new(value.into().into_bytes()),
        }
    }
}

impl InputSource for StringInputSource {
    fn open(&mut self) -> io::Result<()> {
        self.inner.open()
    }

    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.inner.next_chunk()
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

/// A blocking source fed by another thread through a channel.
///
/// The producer side keeps a [`mpsc::Sender`] and sends byte chunks at its
/// own pace; dropping the sender ends the payload. Each `next_chunk` call
/// blocks until a chunk (or the end of the stream) is available, so this
/// source is pulled on a dedicated blocking task by the write command.
pub struct ChannelInputSource {
    rx: mpsc::Receiver<Vec<u8>>,
    done: bool,
}

impl ChannelInputSource {
    pub fn new() -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx, done: false })
    }
}

impl InputSource for ChannelInputSource {
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv() {
            Ok(chunk) => Ok(Some(chunk)),
            Err(_) => {
                self.done = true;
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.done = true;
    }

    fn is_blocking(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_chunking() {
        let mut source = BytesInputSource::new(vec![0xAB; 45]);
        source.open().unwrap();
        assert_eq!(source.next_chunk().unwrap().unwrap().len(), 20);
        assert_eq!(source.next_chunk().unwrap().unwrap().len(), 20);
        assert_eq!(source.next_chunk().unwrap().unwrap().len(), 5);
        assert_eq!(source.next_chunk().unwrap(), None);
    }

    #[test]
    fn test_bytes_reopen_restarts() {
        let mut source = BytesInputSource::new((0..30).collect());
        source.open().unwrap();
        let first = source.next_chunk().unwrap().unwrap();
        source.close();
        source.open().unwrap();
        assert_eq!(source.next_chunk().unwrap().unwrap(), first);
    }

    #[test]
    fn test_bytes_unopened_is_empty() {
        let mut source = BytesInputSource::new(vec![1, 2, 3]);
        assert_eq!(source.next_chunk().unwrap(), None);
    }

    #[test]
    fn test_empty_payload() {
        let mut source = BytesInputSource::new(Vec::new());
        source.open().unwrap();
        assert_eq!(source.next_chunk().unwrap(), None);
    }

    #[test]
    fn test_string_source() {
        let mut source = StringInputSource::new("hello");
        source.open().unwrap();
        assert_eq!(source.next_chunk().unwrap().unwrap(), b"hello".to_vec());
        assert_eq!(source.next_chunk().unwrap(), None);
    }

    #[test]
    fn test_channel_source() {
        let (tx, mut source) = ChannelInputSource::new();
        let producer = std::thread::spawn(move || {
            tx.send(vec![1, 2]).unwrap();
            tx.send(vec![3]).unwrap();
        });
        source.open().unwrap();
        assert_eq!(source.next_chunk().unwrap().unwrap(), vec![1, 2]);
        assert_eq!(source.next_chunk().unwrap().unwrap(), vec![3]);
        // sender dropped ends the payload
        assert_eq!(source.next_chunk().unwrap(), None);
        producer.join().unwrap();
        assert!(source.is_blocking());
    }
}
