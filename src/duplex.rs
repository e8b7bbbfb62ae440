//! Length-prefixed frames over a pair of shared-memory byte rings.
//!
//! On the wire a frame is its payload length as a native-endian `usize`
//! followed by the payload. Rings are smaller than the frames they may carry,
//! so the sending half keeps a backlog of bytes that did not fit and the
//! receiving half reassembles frames from whatever slices the ring hands out.
//! Both halves refuse frames above [`max_frame`] for the ring's capacity.

use crate::{
    errors::ProviderError::{self, *},
    SIZE,
};
use fehler::{throw, throws};
use shmem_ipc::sharedring::{Receiver as IPCReceiver, Sender as IPCSender};
use std::{collections::VecDeque, fs::File, mem};

/// How many ring-fulls a single frame may span.
const RINGS_PER_FRAME: usize = 64;

pub fn max_frame(capacity: usize) -> usize {
    capacity.saturating_mul(RINGS_PER_FRAME)
}

pub struct BufSender {
    tx: IPCSender<u8>,
    max_frame: usize,
    backlog: VecDeque<u8>,
}

impl BufSender {
    pub fn new(tx: IPCSender<u8>, max_frame: usize) -> Self {
        BufSender {
            tx,
            max_frame,
            backlog: VecDeque::new(),
        }
    }

    /// Moves as much of the backlog into the ring as it has room for.
    #[throws(ProviderError)]
    pub fn flush(&mut self) {
        while !self.backlog.is_empty() {
            let mut written = 0;
            let status = unsafe {
                self.tx.send_trusted(|buf| {
                    written = drain_into(buf, &mut self.backlog);
                    written
                })?
            };
            if written == 0 || status.remaining == 0 {
                break;
            }
        }
    }

    /// Queues a frame. Fails with `WouldBlock` while an earlier frame is still
    /// waiting for ring space.
    #[throws(ProviderError)]
    pub fn try_send(&mut self, frame: &[u8]) {
        if frame.len() > self.max_frame {
            throw!(FrameTooLarge(frame.len(), self.max_frame));
        }
        self.flush()?;
        if self.spilled() {
            throw!(WouldBlock);
        }

        self.backlog.extend(frame.len().to_ne_bytes());
        self.backlog.extend(frame);
        self.flush()?;
    }

    /// True while part of an accepted frame still waits for ring space.
    pub fn spilled(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Becomes readable once the ring has room again.
    pub fn notifier(&self) -> &File {
        self.tx.full_signal()
    }
}

pub struct BufReceiver {
    rx: IPCReceiver<u8>,
    assembler: Assembler,
}

impl BufReceiver {
    pub fn new(rx: IPCReceiver<u8>, max_frame: usize) -> Self {
        BufReceiver {
            rx,
            assembler: Assembler::new(max_frame),
        }
    }

    /// Returns the next complete frame, or `WouldBlock` if the ring runs dry first.
    #[throws(ProviderError)]
    pub fn try_recv(&mut self) -> Vec<u8> {
        let mut frame = None;
        let mut failure = None;

        while frame.is_none() && failure.is_none() {
            let mut consumed = 0;
            let status = unsafe {
                self.rx.receive_trusted(|data| {
                    while consumed < data.len() && frame.is_none() {
                        match self.assembler.feed(&data[consumed..]) {
                            Ok((n, done)) => {
                                consumed += n;
                                frame = done;
                            }
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    consumed
                })?
            };
            if consumed == 0 || status.remaining == 0 {
                break;
            }
        }

        if let Some(e) = failure {
            throw!(e);
        }
        frame.ok_or(WouldBlock)?
    }

    /// Becomes readable once the ring has data.
    pub fn notifier(&self) -> &File {
        self.rx.empty_signal()
    }
}

enum Progress {
    Prefix { bytes: [u8; SIZE], filled: usize },
    Payload { len: usize, bytes: Vec<u8> },
}

impl Progress {
    fn start() -> Self {
        Progress::Prefix {
            bytes: [0; SIZE],
            filled: 0,
        }
    }
}

/// Rebuilds frames from arbitrary slices of the byte stream.
struct Assembler {
    max_frame: usize,
    progress: Progress,
}

impl Assembler {
    fn new(max_frame: usize) -> Self {
        Assembler {
            max_frame,
            progress: Progress::start(),
        }
    }

    /// Consumes a prefix of `data`. Returns how many bytes were used and the
    /// frame they completed, if any.
    fn feed(&mut self, data: &[u8]) -> Result<(usize, Option<Vec<u8>>), ProviderError> {
        match &mut self.progress {
            Progress::Prefix { bytes, filled } => {
                let n = (SIZE - *filled).min(data.len());
                bytes[*filled..*filled + n].copy_from_slice(&data[..n]);
                *filled += n;
                if *filled < SIZE {
                    return Ok((n, None));
                }

                let len = usize::from_ne_bytes(*bytes);
                if len > self.max_frame {
                    self.progress = Progress::start();
                    return Err(FrameTooLarge(len, self.max_frame));
                }
                if len == 0 {
                    self.progress = Progress::start();
                    return Ok((n, Some(Vec::new())));
                }
                self.progress = Progress::Payload {
                    len,
                    bytes: Vec::with_capacity(len),
                };
                Ok((n, None))
            }
            Progress::Payload { len, bytes } => {
                let n = (*len - bytes.len()).min(data.len());
                bytes.extend_from_slice(&data[..n]);
                if bytes.len() < *len {
                    return Ok((n, None));
                }
                match mem::replace(&mut self.progress, Progress::start()) {
                    Progress::Payload { bytes, .. } => Ok((n, Some(bytes))),
                    Progress::Prefix { .. } => Ok((n, None)),
                }
            }
        }
    }
}

fn drain_into(buf: &mut [u8], backlog: &mut VecDeque<u8>) -> usize {
    let n = buf.len().min(backlog.len());
    for (slot, byte) in buf.iter_mut().zip(backlog.drain(..n)) {
        *slot = byte;
    }
    n
}
