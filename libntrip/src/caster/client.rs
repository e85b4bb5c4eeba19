use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use futures::Stream;
use futures::lock::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio_util::codec::Encoder;

use crate::nmea::{self, Sentence};

use super::handshake::{self, Line};
use super::{CasterConfig, Error, HandshakeError, Stage};


/// State of the caster session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    AwaitingHandshakeAck,
    Streaming,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Disconnected => write!(f, "disconnected"),
            State::Connecting => write!(f, "connecting"),
            State::AwaitingHandshakeAck => write!(f, "awaiting handshake"),
            State::Streaming => write!(f, "streaming"),
        }
    }
}


/// Outcome of a successful [`ClientHandle::submit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The sentence has been written to the caster.
    Sent,

    /// No session is streaming, the sentence has been discarded.
    Dropped,
}


/// Callback invoked on every state change, in order of the transitions.
pub type StateObserver = Box<dyn Fn(State) + Send + Sync>;


struct Session {
    state: State,
    writer: Option<OwnedWriteHalf>,
    generation: u64,
    notify: watch::Sender<State>,
    observer: Option<StateObserver>,
}

impl Session {
    fn set_state(&mut self, state: State) {
        if self.state != state {
            tracing::debug!(from=%self.state, to=%state, "caster session state changed");

            if let Some(observer) = &self.observer {
                observer(state);
            }
        }

        self.state = state;
        self.notify.send_replace(state);
    }

    /// Start a new session, invalidating everything tied to the old one.
    fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.set_state(State::Connecting);
        self.generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    fn reset(&mut self) -> Option<OwnedWriteHalf> {
        self.generation += 1;
        self.set_state(State::Disconnected);
        self.writer.take()
    }
}


/// NTRIP client owning at most one caster session.
pub struct Client {
    config: Arc<CasterConfig>,
    session: Arc<Mutex<Session>>,
}

impl Client {
    pub fn new(config: CasterConfig) -> Self {
        let (notify, _) = watch::channel(State::Disconnected);

        let session = Session {
            state: State::Disconnected,
            writer: None,
            generation: 0,
            notify,
            observer: None,
        };

        Self {
            config: Arc::new(config),
            session: Arc::new(Mutex::new(session)),
        }
    }

    pub fn config(&self) -> &CasterConfig {
        &self.config
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            session: self.session.clone(),
        }
    }

    /// Connect to the caster and perform the handshake.
    ///
    /// On success the session is streaming and the returned [`Corrections`]
    /// yield the correction data sent by the caster. Fails with
    /// [`Error::AlreadyConnected`] unless the session is disconnected.
    pub async fn connect(&self) -> Result<Corrections, Error> {
        let generation = {
            let mut session = self.session.lock().await;

            if session.state != State::Disconnected {
                tracing::debug!("caster session already active");
                return Err(Error::AlreadyConnected);
            }

            session.begin()
        };

        let mut pending = Pending {
            session: self.session.clone(),
            generation,
            armed: true,
        };

        match self.establish(generation).await {
            Ok(corrections) => {
                pending.armed = false;
                Ok(corrections)
            },
            Err(err) => {
                let mut session = self.session.lock().await;
                if session.is_current(generation) {
                    session.reset();
                }
                pending.armed = false;

                tracing::debug!(error=%err, "connecting to caster failed");
                Err(err)
            },
        }
    }

    async fn establish(&self, generation: u64) -> Result<Corrections, Error> {
        let config = &self.config;

        tracing::debug!(host=%config.host, port=config.port, "connecting to caster");

        let connect = TcpStream::connect((config.host.as_str(), config.port));
        let stream = tokio::time::timeout(config.connect_timeout, connect).await
            .map_err(|_| Error::Timeout(Stage::Connect))??;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(config.chunk_size, reader);

        self.transition(generation, State::AwaitingHandshakeAck).await?;

        tracing::debug!(mountpoint=%config.mountpoint, "requesting correction stream");

        let handshake = perform_handshake(config, &mut reader, &mut writer);
        tokio::time::timeout(config.handshake_timeout, handshake).await
            .map_err(|_| HandshakeError::Timeout)??;

        {
            let mut session = self.session.lock().await;
            if !session.is_current(generation) {
                return Err(aborted());
            }

            session.writer = Some(writer);
            session.set_state(State::Streaming);
        }

        tracing::debug!(host=%config.host, mountpoint=%config.mountpoint, "caster accepted request");

        Ok(Corrections {
            reader,
            session: self.session.clone(),
            generation,
            chunk_size: config.chunk_size,
            interval: config.correction_interval,
            read_timeout: config.read_timeout,
            pause: false,
            done: false,
        })
    }

    async fn transition(&self, generation: u64, state: State) -> Result<(), Error> {
        let mut session = self.session.lock().await;
        if !session.is_current(generation) {
            return Err(aborted());
        }

        session.set_state(state);
        Ok(())
    }

    pub async fn state(&self) -> State {
        self.handle().state().await
    }

    pub async fn submit(&self, sentence: &Sentence) -> Result<Submission, Error> {
        self.handle().submit(sentence).await
    }

    pub async fn disconnect(&self) {
        self.handle().disconnect().await
    }
}

async fn perform_handshake(
    config: &CasterConfig,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> Result<(), Error> {
    let mut request = BytesMut::new();
    handshake::encode_request(config, &mut request);

    writer.write_all(&request).await?;
    writer.flush().await?;

    let mut line = Vec::new();
    for _ in 0..config.max_handshake_lines {
        line.clear();

        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(HandshakeError::Closed.into());
        }

        match handshake::classify_line(&line) {
            Line::Accepted => return Ok(()),
            Line::Rejected(err) => return Err(err.into()),
            Line::Other => {
                tracing::trace!(line=%String::from_utf8_lossy(&line).trim_end(), "discarding response line");
            },
        }
    }

    Err(HandshakeError::LineLimit(config.max_handshake_lines).into())
}

/// Resets the session when a connect attempt is dropped before it completes.
struct Pending {
    session: Arc<Mutex<Session>>,
    generation: u64,
    armed: bool,
}

impl Drop for Pending {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::debug!("caster connect attempt abandoned");

        let generation = self.generation;

        if let Some(mut session) = self.session.try_lock() {
            if session.is_current(generation) {
                session.reset();
            }
            return;
        }

        // lock is busy, finish the reset asynchronously
        let session = self.session.clone();
        let reset = async move {
            let mut session = session.lock().await;
            if session.is_current(generation) {
                session.reset();
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(reset);
            },
            Err(_) => tracing::warn!("no runtime available, caster session left pending"),
        }
    }
}

fn aborted() -> Error {
    let err = std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "session reset during connect");
    Error::Io(err)
}


/// Shared handle to the session of a [`Client`].
#[derive(Clone)]
pub struct ClientHandle {
    session: Arc<Mutex<Session>>,
}

impl ClientHandle {
    pub async fn state(&self) -> State {
        self.session.lock().await.state
    }

    /// Receiver for the latest state of the session.
    ///
    /// Rapid transitions may be coalesced, use [`ClientHandle::set_observer`]
    /// to see every single one.
    pub async fn watch_state(&self) -> watch::Receiver<State> {
        self.session.lock().await.notify.subscribe()
    }

    /// Install a callback invoked synchronously on each state transition,
    /// replacing any previous one.
    pub async fn set_observer(&self, observer: Option<StateObserver>) {
        self.session.lock().await.observer = observer;
    }

    /// Send a sentence to the caster.
    ///
    /// Sentences submitted while the session is not streaming are dropped.
    /// A write failure ends the session.
    pub async fn submit(&self, sentence: &Sentence) -> Result<Submission, Error> {
        let mut session = self.session.lock().await;

        if session.state != State::Streaming {
            tracing::trace!(sentence=%sentence, "no caster session, dropping sentence");
            return Ok(Submission::Dropped);
        }

        let Some(writer) = session.writer.as_mut() else {
            return Ok(Submission::Dropped);
        };

        let mut buf = BytesMut::new();
        nmea::Codec::new().encode(sentence, &mut buf)?;

        let res: std::io::Result<()> = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }.await;

        match res {
            Ok(()) => {
                tracing::trace!(sentence=%sentence, "sentence sent to caster");
                Ok(Submission::Sent)
            },
            Err(err) => {
                tracing::warn!(error=%err, "sending sentence to caster failed");
                session.reset();
                Err(err.into())
            },
        }
    }

    /// End the current session, if any.
    pub async fn disconnect(&self) {
        let writer = self.session.lock().await.reset();

        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                tracing::debug!(error=%err, "error shutting down caster connection");
            }
        }
    }
}


/// Correction data streamed by the caster.
///
/// Every item is the result of a single read of at most the configured chunk
/// size. After each chunk the stream pauses for the configured interval. The
/// stream ends when the caster closes the connection, on error, or when the
/// session has been reset, and cannot be restarted.
pub struct Corrections {
    reader: BufReader<OwnedReadHalf>,
    session: Arc<Mutex<Session>>,
    generation: u64,
    chunk_size: usize,
    interval: Duration,
    read_timeout: Option<Duration>,
    pause: bool,
    done: bool,
}

impl Corrections {
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, Error>> {
        if self.done {
            return None;
        }

        if self.pause {
            tokio::time::sleep(self.interval).await;
            self.pause = false;
        }

        if !self.session.lock().await.is_current(self.generation) {
            self.done = true;
            return None;
        }

        match self.read().await {
            Ok(Some(chunk)) => {
                tracing::trace!(len=chunk.len(), "received correction data");
                self.pause = true;
                Some(Ok(chunk))
            },
            Ok(None) => {
                tracing::debug!("caster closed the connection");
                self.finish().await;
                None
            },
            Err(err) => {
                tracing::warn!(error=%err, "receiving correction data failed");
                self.finish().await;
                Some(Err(err))
            },
        }
    }

    /// Stop receiving and end the session this stream belongs to.
    pub async fn close(mut self) {
        self.finish().await;
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Error>> {
        futures::stream::unfold(self, |mut corrections| async move {
            let item = corrections.next_chunk().await?;
            Some((item, corrections))
        })
    }

    async fn read(&mut self) -> Result<Option<Bytes>, Error> {
        let mut buf = vec![0; self.chunk_size];

        let n = match self.read_timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, self.reader.read(&mut buf)).await
                    .map_err(|_| Error::Timeout(Stage::Read))??
            },
            None => self.reader.read(&mut buf).await?,
        };

        if n == 0 {
            return Ok(None);
        }

        buf.truncate(n);
        Ok(Some(buf.into()))
    }

    async fn finish(&mut self) {
        self.done = true;

        let writer = {
            let mut session = self.session.lock().await;
            if !session.is_current(self.generation) {
                return;
            }

            session.reset()
        };

        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}
