//! `dsplink watch`: subscribe and stream samples until interrupted.

use std::pin::pin;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use dsplink_core::{ChannelState, DeviceClient, Sample, ValueFormat};

use crate::cli::{GlobalOpts, WatchArgs};
use crate::error::CliError;
use crate::output::{self, Style};

use super::parse_param;

pub async fn handle(client: &DeviceClient, args: &WatchArgs, style: Style, global: &GlobalOpts) -> Result<(), CliError> {
    let params = args
        .params
        .iter()
        .map(|name| parse_param(name))
        .collect::<Result<Vec<_>, _>>()?;
    let format = ValueFormat::from(args.format);

    let (tx, mut rx) = mpsc::unbounded_channel::<Sample>();
    let mut handles = Vec::with_capacity(params.len());
    for param in &params {
        let tx = tx.clone();
        let handle = client
            .subscribe(param, format, move |sample: &Sample| {
                let _ = tx.send(sample.clone());
            })
            .await;
        match handle {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                release_all(handles).await;
                return Err(e.into());
            }
        }
    }
    drop(tx);
    debug!(params = params.len(), %format, "watching");

    let mut status = client.watch_status();
    let mut interrupt = pin!(tokio::signal::ctrl_c());
    let mut deadline = pin!(async {
        match args.duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    });
    let mut seen = 0_usize;

    let result = loop {
        tokio::select! {
            biased;

            _ = &mut interrupt => break Ok(()),
            () = &mut deadline => break Ok(()),
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = status.borrow_and_update().state;
                match state {
                    ChannelState::Ready => debug!("channel ready"),
                    ChannelState::Closed => break Ok(()),
                    other => warn!(state = %other, "device connection interrupted, retrying"),
                }
            }
            sample = rx.recv() => {
                let Some(sample) = sample else { break Ok(()) };
                match output::render_sample(style, &sample) {
                    Ok(line) => output::print_output(&line, global.quiet),
                    Err(e) => break Err(e),
                }
                seen += 1;
                if args.count.is_some_and(|n| seen >= n) {
                    break Ok(());
                }
            }
        }
    };

    release_all(handles).await;
    result
}

async fn release_all(handles: Vec<dsplink_core::SubscriptionHandle>) {
    for handle in handles {
        if let Err(e) = handle.release().await {
            warn!(error = %e, "unsubscribe failed");
        }
    }
}
