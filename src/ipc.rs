//! Shared-memory transport to a widget surface running in its own process.
//!
//! The surface side binds an [`IpcListener`] on a Unix socket. A host connects
//! with [`IpcTransport::connect`], asking for a ring capacity; the listener
//! creates one ring per direction and passes their file descriptors back over
//! the socket. After that the socket is only watched for hang-ups and all
//! frames travel through the rings.

use crate::{
    duplex::{max_frame, BufReceiver, BufSender},
    errors::ProviderError::{self, *},
    transport::Transport,
    CAPACITY, SIZE,
};
use async_trait::async_trait;
use fehler::{throw, throws};
use log::{debug, info};
use sendfd::{RecvWithFd, SendWithFd};
use shmem_ipc::sharedring::{Receiver as IPCReceiver, Sender as IPCSender};
use std::{
    fs::{remove_file, File},
    os::unix::{
        io::FromRawFd,
        prelude::{AsRawFd, RawFd},
    },
    path::{Path, PathBuf},
};
use tokio::{
    io::{unix::AsyncFd, AsyncReadExt, AsyncWriteExt, Interest},
    net::{UnixListener, UnixStream},
    select,
};

pub struct IpcTransport {
    stream: UnixStream,
    tx: BufSender,
    rx: BufReceiver,
    tx_notifier: AsyncFd<RawFd>,
    rx_notifier: AsyncFd<RawFd>,
}

impl IpcTransport {
    /// Connects to a listening surface with the default ring capacity.
    #[throws(ProviderError)]
    pub async fn connect<P>(path: P) -> Self
    where
        P: AsRef<Path>,
    {
        Self::connect_with_capacity(path, CAPACITY).await?
    }

    #[throws(ProviderError)]
    pub async fn connect_with_capacity<P>(path: P, capacity: usize) -> Self
    where
        P: AsRef<Path>,
    {
        let mut stream = UnixStream::connect(path).await?;

        // ask the surface for rings of this capacity
        stream.write_all(&capacity.to_ne_bytes()).await?;

        let mut len = [0; SIZE];
        let mut fds: [RawFd; 6] = [-1; 6];
        stream.readable().await?;
        let stdstream = stream.into_std()?; // sendfd has no tokio support
        let (n, nfds) = stdstream.recv_with_fd(&mut len, &mut fds)?;
        // owned right away so an early return closes them
        let files: Vec<File> = fds[..nfds.min(fds.len())]
            .iter()
            .map(|fd| unsafe { File::from_raw_fd(*fd) })
            .collect();
        let stream = UnixStream::from_std(stdstream)?;
        if n < SIZE {
            throw!(BytesTooShort(SIZE, n))
        }
        let [tx_memfd, tx_empty, tx_full, rx_memfd, rx_empty, rx_full]: [File; 6] = files
            .try_into()
            .map_err(|files: Vec<File>| BytesTooShort(fds.len(), files.len()))?;

        let len = usize::from_ne_bytes(len);
        let tx = unsafe { IPCSender::open(len, tx_memfd, tx_empty, tx_full)? };
        let rx = unsafe { IPCReceiver::open(len, rx_memfd, rx_empty, rx_full)? };
        debug!("Connected to widget surface with capacity {}", len);

        let limit = max_frame(len);
        Self::from_parts(stream, BufSender::new(tx, limit), BufReceiver::new(rx, limit))?
    }

    #[throws(ProviderError)]
    fn from_parts(stream: UnixStream, tx: BufSender, rx: BufReceiver) -> Self {
        Self {
            stream,
            tx_notifier: AsyncFd::new(tx.notifier().as_raw_fd())?,
            tx,
            rx_notifier: AsyncFd::new(rx.notifier().as_raw_fd())?,
            rx,
        }
    }

    #[throws(ProviderError)]
    pub fn try_recv(&mut self) -> Vec<u8> {
        self.rx.try_recv()?
    }

    #[throws(ProviderError)]
    pub fn try_send(&mut self, frame: &[u8]) {
        self.tx.try_send(frame)?
    }

    #[throws(ProviderError)]
    async fn wait_readable(&self) {
        select! {
            ready = self.stream.ready(Interest::READABLE) => {
                if ready?.is_read_closed() {
                    throw!(ConnectionClosed)
                }
            }
            guard = self.rx_notifier.readable() => {
                guard?.clear_ready();
            }
        }
    }

    #[throws(ProviderError)]
    async fn wait_writable(&self) {
        select! {
            ready = self.stream.ready(Interest::READABLE) => {
                if ready?.is_read_closed() {
                    throw!(ConnectionClosed)
                }
            }
            guard = self.tx_notifier.readable() => {
                guard?.clear_ready();
            }
        }
    }
}

#[async_trait]
impl Transport for IpcTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ProviderError> {
        loop {
            match self.try_send(frame) {
                Ok(_) => break,
                Err(WouldBlock) => self.wait_writable().await?,
                Err(e) => return Err(e),
            }
        }
        // frames larger than the free space leave a tail in the spill
        while self.tx.spilled() {
            self.wait_writable().await?;
            self.tx.flush()?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ProviderError> {
        loop {
            match self.try_recv() {
                Ok(frame) => break Ok(frame),
                Err(WouldBlock) => self.wait_readable().await?,
                Err(e) => break Err(e),
            }
        }
    }
}

/// The surface side: accepts hosts and hands each one a pair of rings.
pub struct IpcListener {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl IpcListener {
    #[throws(ProviderError)]
    pub fn bind<P>(path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let listener = UnixListener::bind(path)?;
        info!("Widget surface listening on {}", path.display());

        Self {
            socket_path: path.to_owned(),
            listener,
        }
    }

    #[throws(ProviderError)]
    pub async fn accept(&self) -> IpcTransport {
        let (mut stream, _) = self.listener.accept().await?;

        let mut capacity = [0; SIZE];
        stream.read_exact(&mut capacity).await?;
        let capacity = usize::from_ne_bytes(capacity);

        let rx = IPCReceiver::new(capacity)?;
        let tx = IPCSender::new(capacity)?;

        stream.writable().await?;
        let stdstream = stream.into_std()?;
        stdstream.send_with_fd(
            &capacity.to_ne_bytes(),
            &[
                rx.memfd().as_file().as_raw_fd(),
                rx.empty_signal().as_raw_fd(),
                rx.full_signal().as_raw_fd(),
                tx.memfd().as_file().as_raw_fd(),
                tx.empty_signal().as_raw_fd(),
                tx.full_signal().as_raw_fd(),
            ],
        )?;
        let stream = UnixStream::from_std(stdstream)?;
        info!("Host connected with capacity {}", capacity);

        let limit = max_frame(capacity);
        IpcTransport::from_parts(stream, BufSender::new(tx, limit), BufReceiver::new(rx, limit))?
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = remove_file(&self.socket_path);
    }
}
