use std::io;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::wal::Wal;

pub(super) type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: Ack },
    Control(Control),
}

/// Requests that are answered between batches, never inside one.
pub(super) enum Control {
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the log and group-commits appends.
///
/// Every append that is already queued when the first one is picked up joins
/// the same batch: one write, one fsync, then every caller is answered with
/// the batch outcome. Control commands commit the open batch first so
/// ordering on disk matches ordering on the channel.
pub(super) async fn run_writer(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<(Event, Ack)> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    next = rx.try_recv().ok();
                }
                WalCommand::Control(control) => {
                    commit(&mut wal, &mut batch);
                    handle_control(&mut wal, control);
                }
            }
        }
        commit(&mut wal, &mut batch);
    }
}

fn commit(wal: &mut Wal, batch: &mut Vec<(Event, Ack)>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let (events, acks): (Vec<Event>, Vec<Ack>) = batch.drain(..).unzip();
    let outcome = wal.append_batch(&events);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &outcome {
        tracing::error!("log commit of {} events failed: {e}", events.len());
    }

    for ack in acks {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(reply);
    }
}

fn handle_control(wal: &mut Wal, control: Control) {
    match control {
        Control::Compact { events, response } => {
            let result =
                Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        Control::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}
