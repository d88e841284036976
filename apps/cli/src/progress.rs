//! Progress bar observer.

use std::sync::Mutex;

use cloner_core::events::{ClonerEvent, ClonerObserver, TracingObserver};
use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str = "{spinner:.green} {msg:10} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Draws transfer progress; every other event goes to the log.
#[derive(Default)]
pub struct ProgressObserver {
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressObserver {
    fn with_bar(&self, f: impl FnOnce(&mut Option<ProgressBar>)) {
        if let Ok(mut bar) = self.bar.lock() {
            f(&mut bar);
        }
    }
}

impl ClonerObserver for ProgressObserver {
    fn on_event(&self, event: &ClonerEvent) {
        match event {
            ClonerEvent::Progress {
                phase,
                current,
                total,
            } => self.with_bar(|bar| {
                let pb = bar.get_or_insert_with(|| {
                    let pb = ProgressBar::new(*total);
                    if let Ok(style) = ProgressStyle::default_bar().template(TEMPLATE) {
                        pb.set_style(style.progress_chars("#>-"));
                    }
                    pb
                });
                pb.set_message(phase.to_string());
                pb.set_length(*total);
                pb.set_position(*current);
            }),
            ClonerEvent::Retry {
                address,
                attempt,
                max_retries,
                reason,
            } => self.with_bar(|bar| match bar {
                Some(pb) => pb.println(format!(
                    "retry {}/{} at 0x{:08X}: {}",
                    attempt, max_retries, address, reason
                )),
                None => TracingObserver.on_event(event),
            }),
            ClonerEvent::Complete { .. } => {
                self.with_bar(|bar| {
                    if let Some(pb) = bar.take() {
                        pb.finish_with_message("done");
                    }
                });
                TracingObserver.on_event(event);
            }
            ClonerEvent::Error { .. } => {
                self.with_bar(|bar| {
                    if let Some(pb) = bar.take() {
                        pb.abandon_with_message("failed");
                    }
                });
                TracingObserver.on_event(event);
            }
            // Too chatty for a terminal.
            ClonerEvent::Packet { .. } => {}
            _ => TracingObserver.on_event(event),
        }
    }
}
