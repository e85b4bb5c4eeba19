use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::caster::{Client, ClientHandle, Corrections, State, StateObserver, Submission};
use crate::nmea;

use super::{BridgeConfig, Error, Event, LinkState};


type Events = mpsc::UnboundedSender<Event>;

fn emit(events: &Events, event: Event) {
    // nobody listening is fine, events are informational
    let _ = events.send(event);
}


/// Relay between a serial channel to the receiver and an NTRIP caster.
///
/// Position fixes read from the receiver are submitted to the caster,
/// correction data from the caster is written back to the receiver. The
/// caster session is only established after the configured handshake delay
/// and re-established according to the reconnect policy.
pub struct Bridge {
    config: BridgeConfig,
    client: Arc<Client>,
    events: Events,
}

impl Bridge {
    pub fn new(config: BridgeConfig, client: Client, events: Events) -> Self {
        Self {
            config,
            client: Arc::new(client),
            events,
        }
    }

    pub fn client(&self) -> ClientHandle {
        self.client.handle()
    }

    /// Relay data until the serial channel is lost or `cancel` is triggered.
    ///
    /// Losing the serial channel ends the inbound direction right away. An
    /// active caster session is left alone and ends once the next correction
    /// chunk cannot be written to the receiver. Cancelling stops all tasks
    /// and closes the caster session once they have exited. Caster failures
    /// are reported as [`Event::Error`] and do not end the relay.
    ///
    /// Replaces any state observer installed on the client for the duration
    /// of the relay.
    pub async fn run<S>(&self, serial: S, cancel: CancellationToken) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(serial);
        let stop = cancel.child_token();
        let gone = stop.child_token();
        let handle = self.client.handle();

        // report transitions from the task causing them to keep event order
        let events = self.events.clone();
        let observer: StateObserver = Box::new(move |state| emit(&events, Event::Caster(state)));
        handle.set_observer(Some(observer)).await;

        tracing::debug!("receiver connected, starting relay");
        emit(&self.events, Event::Receiver(LinkState::Connected));

        let inbound = tokio::spawn(inbound(reader, handle.clone(), self.events.clone(), stop.clone()));

        let outbound = tokio::spawn(outbound(
            self.client.clone(),
            self.config.clone(),
            writer,
            self.events.clone(),
            stop.clone(),
            gone.clone(),
        ));

        let inbound_res = inbound.await;
        gone.cancel();

        if !stop.is_cancelled() {
            tracing::debug!("receiver lost, caster session kept until the next correction write");
        }
        emit(&self.events, Event::Receiver(LinkState::Disconnected));

        let outbound_res = outbound.await;

        // all loops are gone, nothing uses the caster connection anymore
        if self.client.state().await != State::Disconnected {
            self.client.disconnect().await;
        }
        handle.set_observer(None).await;

        tracing::debug!("relay stopped");

        inbound_res??;
        outbound_res??;

        Ok(())
    }
}


/// Read sentences from the receiver and submit position fixes to the caster.
async fn inbound<R>(
    reader: R,
    client: ClientHandle,
    events: Events,
    stop: CancellationToken,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut sentences = nmea::Codec::new().wrap_read(reader);

    loop {
        let sentence = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            item = sentences.next() => match item {
                Some(Ok(sentence)) => sentence,
                Some(Err(err)) => {
                    tracing::warn!(error=%err, "reading from receiver failed");
                    emit(&events, Event::Error(format!("reading from receiver failed: {err}")));
                    return Err(err);
                },
                None => {
                    tracing::debug!("receiver closed the connection");
                    return Ok(());
                },
            },
        };

        tracing::trace!(sentence=%sentence, "received sentence");
        emit(&events, Event::Sentence(sentence.clone()));

        if !sentence.is_position_fix() {
            continue;
        }

        match client.submit(&sentence).await {
            Ok(Submission::Sent) => emit(&events, Event::Submitted(sentence)),
            Ok(Submission::Dropped) => {},
            Err(err) => {
                emit(&events, Event::Error(format!("sending position to caster failed: {err}")));
            },
        }
    }
}

/// Connect to the caster after the handshake delay and forward corrections
/// to the receiver, reconnecting as configured.
///
/// No new session is started once the receiver is `gone`, an active one is
/// forwarded until writing to the receiver fails.
async fn outbound<W>(
    client: Arc<Client>,
    config: BridgeConfig,
    mut writer: W,
    events: Events,
    stop: CancellationToken,
    gone: CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    tracing::debug!(delay=?config.handshake_delay, "delaying caster connection");

    if !sleep_or_stop(config.handshake_delay, &gone).await {
        return Ok(());
    }

    let policy = config.reconnect;
    let mut attempts = 0;

    loop {
        let res = tokio::select! {
            biased;
            _ = gone.cancelled() => return Ok(()),
            res = client.connect() => res,
        };

        match res {
            Ok(corrections) => {
                attempts = 0;

                if let Err(err) = forward(corrections, &mut writer, &events, &stop).await {
                    if gone.is_cancelled() {
                        tracing::debug!(error=%err, "receiver gone, caster session closed");
                        return Ok(());
                    }

                    tracing::warn!(error=%err, "writing corrections to receiver failed");
                    emit(&events, Event::Error(format!("writing corrections to receiver failed: {err}")));
                    stop.cancel();
                    return Err(err);
                }
            },
            Err(err) => {
                tracing::warn!(error=%err, "caster connection failed");
                emit(&events, Event::Error(format!("caster connection failed: {err}")));
            },
        }

        if gone.is_cancelled() {
            return Ok(());
        }

        if attempts >= policy.max_attempts {
            tracing::warn!(attempts, "giving up on caster");
            emit(&events, Event::Error("giving up on caster connection".to_string()));
            return Ok(());
        }

        attempts += 1;
        tracing::debug!(attempt=attempts, max=policy.max_attempts, "reconnecting to caster");

        if !sleep_or_stop(policy.delay, &gone).await {
            return Ok(());
        }
    }
}

/// Write correction data to the receiver until the caster session ends.
///
/// Fails only if writing to the receiver fails, the caster session is closed
/// in that case.
async fn forward<W>(
    mut corrections: Corrections,
    writer: &mut W,
    events: &Events,
    stop: &CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let chunk = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            chunk = corrections.next_chunk() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                emit(events, Event::Error(format!("receiving corrections failed: {err}")));
                return Ok(());
            },
            None => {
                tracing::debug!("correction stream ended");
                return Ok(());
            },
        };

        let res: std::io::Result<()> = async {
            writer.write_all(&chunk).await?;
            writer.flush().await
        }.await;

        if let Err(err) = res {
            corrections.close().await;
            return Err(err);
        }

        tracing::trace!(len=chunk.len(), "forwarded correction data to receiver");
        emit(events, Event::Corrections(chunk));
    }
}

async fn sleep_or_stop(duration: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::caster::{CasterConfig, Credentials};
    use crate::nmea::SentenceKind;
    use crate::relay::ReconnectPolicy;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};
    use tokio::net::{TcpListener, TcpStream};

    const GSV: &[u8] = b"$GPGSV,3,1,11,10,63,137,17,07,61,098,15,05,59,290,20,08,54,157,30*70";
    const GGA: &[u8] = b"$GNGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,*76";

    fn config(port: u16) -> (CasterConfig, BridgeConfig) {
        let mut caster = CasterConfig::new("127.0.0.1", port, "MOUNT", Credentials::new("user", "pass"));
        caster.correction_interval = Duration::from_millis(20);
        caster.connect_timeout = Duration::from_secs(2);

        let bridge = BridgeConfig {
            handshake_delay: Duration::from_millis(50),
            reconnect: ReconnectPolicy::disabled(),
        };

        (caster, bridge)
    }

    async fn accept(listener: &TcpListener) -> BufReader<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);

        loop {
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();

            if line == "\r\n" || line.is_empty() {
                break;
            }
        }

        stream.write_all(b"ICY 200 OK\r\n").await.unwrap();
        stream
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<Event>, mut pred: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        let wait = async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        };

        tokio::time::timeout(Duration::from_secs(5), wait).await
            .expect("timed out waiting for event")
    }

    async fn read_exact(receiver: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        receiver.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (caster_config, bridge_config) = config(listener.local_addr().unwrap().port());

        let small: Vec<u8> = (0..10).collect();
        let large: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();

        let (small_c, large_c) = (small.clone(), large.clone());
        let (next_tx, next_rx) = tokio::sync::oneshot::channel::<()>();

        let caster = tokio::spawn(async move {
            let mut stream = accept(&listener).await;

            stream.write_all(&small_c).await.unwrap();
            stream.flush().await.unwrap();

            next_rx.await.unwrap();
            stream.write_all(&large_c).await.unwrap();
            stream.flush().await.unwrap();

            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            line
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(bridge_config, Client::new(caster_config), tx);

        let (serial, mut receiver) = tokio::io::duplex(16 * 1024);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(serial, cancel).await })
        };

        wait_for(&mut rx, |e| *e == Event::Receiver(LinkState::Connected)).await;

        // sentences before the caster session is up are displayed but dropped
        receiver.write_all(&[GSV, nmea::TERMINATOR, GGA, nmea::TERMINATOR].concat()).await.unwrap();

        let event = wait_for(&mut rx, |e| matches!(e, Event::Sentence(_))).await;
        let Event::Sentence(sentence) = event else { unreachable!() };
        assert_eq!(sentence.kind(), SentenceKind::Other);

        wait_for(&mut rx, |e| *e == Event::Caster(State::Streaming)).await;

        // correction data is forwarded verbatim and in order
        assert_eq!(read_exact(&mut receiver, small.len()).await, small);

        // session state is always reported before any data
        let event = wait_for(&mut rx, |e| matches!(e, Event::Caster(_) | Event::Corrections(_))).await;
        assert_eq!(event, Event::Corrections(small.clone().into()));

        next_tx.send(()).unwrap();
        assert_eq!(read_exact(&mut receiver, large.len()).await, large);

        // a sentence split across writes is submitted once complete
        receiver.write_all(&GGA[..10]).await.unwrap();
        receiver.write_all(&GGA[10..]).await.unwrap();
        receiver.write_all(b"\r\n").await.unwrap();

        let event = wait_for(&mut rx, |e| matches!(e, Event::Submitted(_))).await;
        assert_eq!(event, Event::Submitted(nmea::Sentence::new(GGA)));

        let line = caster.await.unwrap();
        assert_eq!(line.as_bytes(), [GGA, nmea::TERMINATOR].concat());

        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(
            wait_for(&mut rx, |e| matches!(e, Event::Receiver(_))).await,
            Event::Receiver(LinkState::Disconnected),
        );
    }

    #[tokio::test]
    async fn test_correction_pause() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut caster_config, bridge_config) = config(listener.local_addr().unwrap().port());
        caster_config.correction_interval = Duration::from_millis(200);

        tokio::spawn(async move {
            let mut stream = accept(&listener).await;

            for i in 0..2u8 {
                stream.write_all(&[i; 10]).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(bridge_config, Client::new(caster_config), tx);

        let (serial, mut receiver) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(serial, cancel).await })
        };

        assert_eq!(read_exact(&mut receiver, 10).await, [0; 10]);
        let first = tokio::time::Instant::now();

        assert_eq!(read_exact(&mut receiver, 10).await, [1; 10]);
        assert!(first.elapsed() >= Duration::from_millis(150));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_receiver_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (caster_config, mut bridge_config) = config(listener.local_addr().unwrap().port());
        bridge_config.handshake_delay = Duration::from_secs(60);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(bridge_config, Client::new(caster_config), tx);

        let (serial, mut receiver) = tokio::io::duplex(1024);

        let task = tokio::spawn(async move {
            bridge.run(serial, CancellationToken::new()).await
        });

        receiver.write_all(GSV).await.unwrap();
        drop(receiver);

        // ends without waiting for the caster connection delay
        tokio::time::timeout(Duration::from_secs(5), task).await
            .expect("bridge did not stop")
            .unwrap()
            .unwrap();

        // unterminated data is never reported as sentence
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, Event::Sentence(_)));
        }
    }

    #[tokio::test]
    async fn test_receiver_lost_keeps_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (caster_config, bridge_config) = config(listener.local_addr().unwrap().port());

        let (send_tx, send_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut stream = accept(&listener).await;

            send_rx.await.unwrap();
            stream.write_all(&[0xd3; 10]).await.unwrap();
            stream.flush().await.unwrap();

            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(bridge_config, Client::new(caster_config), tx);
        let client = bridge.client();

        let (serial, receiver) = tokio::io::duplex(1024);

        let task = tokio::spawn(async move {
            bridge.run(serial, CancellationToken::new()).await
        });

        wait_for(&mut rx, |e| *e == Event::Caster(State::Streaming)).await;

        drop(receiver);
        wait_for(&mut rx, |e| *e == Event::Receiver(LinkState::Disconnected)).await;

        // caster session outlives the receiver
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state().await, State::Streaming);
        assert!(!task.is_finished());

        // and ends with the first correction that cannot be delivered
        send_tx.send(()).unwrap();
        wait_for(&mut rx, |e| *e == Event::Caster(State::Disconnected)).await;

        tokio::time::timeout(Duration::from_secs(5), task).await
            .expect("bridge did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(client.state().await, State::Disconnected);

        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, Event::Error(_) | Event::Corrections(_)), "{event:?}");
        }
    }

    #[tokio::test]
    async fn test_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (caster_config, mut bridge_config) = config(listener.local_addr().unwrap().port());
        bridge_config.reconnect = ReconnectPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(20),
        };

        tokio::spawn(async move {
            // first session is dropped right after the acknowledgement
            let stream = accept(&listener).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(stream);

            let mut stream = accept(&listener).await;
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(bridge_config, Client::new(caster_config), tx);
        let client = bridge.client();

        let (serial, _receiver) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(serial, cancel).await })
        };

        wait_for(&mut rx, |e| *e == Event::Caster(State::Streaming)).await;
        wait_for(&mut rx, |e| *e == Event::Caster(State::Disconnected)).await;
        wait_for(&mut rx, |e| *e == Event::Caster(State::Streaming)).await;
        assert_eq!(client.state().await, State::Streaming);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(client.state().await, State::Disconnected);
    }

    #[tokio::test]
    async fn test_give_up_keeps_receiver() {
        // bind and release a port so that connecting is refused
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (caster_config, mut bridge_config) = config(port);
        bridge_config.reconnect = ReconnectPolicy {
            max_attempts: 1,
            delay: Duration::from_millis(10),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(bridge_config, Client::new(caster_config), tx);

        let (serial, mut receiver) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(serial, cancel).await })
        };

        let giving_up = Event::Error("giving up on caster connection".to_string());
        wait_for(&mut rx, |e| *e == giving_up).await;

        // receiver data keeps flowing to the display
        receiver.write_all(&[GGA, nmea::TERMINATOR].concat()).await.unwrap();
        let event = wait_for(&mut rx, |e| matches!(e, Event::Sentence(_))).await;
        assert_eq!(event, Event::Sentence(nmea::Sentence::new(GGA)));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
