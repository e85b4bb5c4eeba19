mod bt;
mod cli;

use anyhow::Result;
use clap::Parser;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ntrip::caster::{CasterConfig, Client, Credentials};
use ntrip::nmea::SentenceKind;
use ntrip::relay::{Bridge, BridgeConfig, Event, LinkState, ReconnectPolicy};

use cli::Args;


#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // set up session
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;

    // set up receiver
    let dev = match (args.device, args.name.as_deref()) {
        (Some(address), _) => {
            tracing::debug!("using provided address: {}", address);
            adapter.device(address)?
        },
        (None, Some(name)) => {
            tracing::debug!("no address specified, searching for receiver '{}'", name);
            bt::find_receiver(&adapter, name).await?
        },
        (None, None) => anyhow::bail!("either a device address or name is required"),
    };

    let stream = bt::connect_spp_rfcomm(&session, &dev).await?;

    // set up relay
    let (tx, rx) = mpsc::unbounded_channel();
    let bridge = Bridge::new(bridge_config(&args), Client::new(caster_config(&args)), tx);

    let display = tokio::spawn(display(rx, args.verbose));

    let res = run(&bridge, stream).await;

    // closes the event channel
    drop(bridge);
    display.await?;

    res
}

fn caster_config(args: &Args) -> CasterConfig {
    let credentials = Credentials::new(args.user.clone(), args.password.clone());

    let mut config = CasterConfig::new(args.host.clone(), args.port, args.mountpoint.clone(), credentials);
    config.handshake_timeout = args.handshake_timeout;
    config.correction_interval = args.correction_interval;

    if let Some(agent) = &args.user_agent {
        config.user_agent = agent.clone();
    }

    config
}

fn bridge_config(args: &Args) -> BridgeConfig {
    BridgeConfig {
        handshake_delay: args.handshake_delay,
        reconnect: ReconnectPolicy {
            max_attempts: args.reconnect_attempts,
            delay: args.reconnect_delay,
        },
    }
}

async fn run(bridge: &Bridge, stream: bluer::rfcomm::Stream) -> Result<()> {
    let cancel = CancellationToken::new();

    let relay = bridge.run(stream, cancel.clone());
    tokio::pin!(relay);

    tokio::select! {
        res = &mut relay => {
            res?;
            tracing::trace!("relay terminated");
        },
        sig = tokio::signal::ctrl_c() => {
            sig?;
            tracing::trace!("relay termination requested");

            cancel.cancel();
            relay.await?;
        },
    }

    Ok(())
}

async fn display(mut rx: mpsc::UnboundedReceiver<Event>, verbose: bool) {
    while let Some(event) = rx.recv().await {
        match event {
            Event::Receiver(LinkState::Connected) => println!("receiver: connected"),
            Event::Receiver(LinkState::Disconnected) => println!("receiver: disconnected"),
            Event::Caster(state) => println!("caster:   {state}"),
            Event::Sentence(sentence) => match sentence.kind() {
                SentenceKind::PositionFix => println!("fix:      {sentence}"),
                SentenceKind::Other if verbose => println!("nmea:     {sentence}"),
                SentenceKind::Other => {},
            },
            Event::Submitted(sentence) => {
                if verbose {
                    println!("sent:     {sentence}");
                }
            },
            Event::Corrections(data) => {
                if verbose {
                    println!("rtcm:     {}", pretty_hex::simple_hex(&data));
                } else {
                    println!("rtcm:     {} bytes", data.len());
                }
            },
            Event::Error(msg) => eprintln!("error: {msg}"),
        }
    }
}
