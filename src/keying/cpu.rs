//! CPU keying backend.
//!
//! Runs the reference kernel on a worker thread so dispatch stays
//! asynchronous, the same way the GPU backend behaves. Used when no adapter
//! is available and as the reference in tests.
//!
//! The job queue holds one job behind the one running; dispatch fails
//! instead of queueing more. Dropping the keyer never waits for the worker,
//! which exits after its current job.

use super::kernel::{key_frame, KeyParams};
use super::{ChannelCompletion, ChromaKeySettings, Completion, KeyBackend};
use crate::error::{Error, Result};
use crate::frame::VideoFrame;
use std::sync::mpsc::{self, Sender, SyncSender, TrySendError};
use std::thread;
use tracing::debug;

struct KeyJob {
    frame: VideoFrame,
    params: KeyParams,
    reply: Sender<Result<VideoFrame>>,
}

pub struct CpuKeyer {
    tx: Option<SyncSender<KeyJob>>,
}

impl CpuKeyer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::sync_channel::<KeyJob>(1);
        let spawned = thread::Builder::new()
            .name("keymix-cpu-keyer".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let result = job
                        .frame
                        .to_rgba()
                        .map(|rgba| key_frame(&rgba, &job.params));
                    // The waiter may have timed out already.
                    let _ = job.reply.send(result);
                }
                debug!("CPU keyer worker exiting");
            })
            .is_ok();
        Self {
            tx: spawned.then_some(tx),
        }
    }
}

impl Default for CpuKeyer {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyBackend for CpuKeyer {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn dispatch(
        &mut self,
        frame: &VideoFrame,
        settings: &ChromaKeySettings,
    ) -> Result<Box<dyn Completion>> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::gpu("CPU keyer worker is not running"))?;
        let (reply, completion) = ChannelCompletion::pair();
        let job = KeyJob {
            frame: frame.clone(),
            params: KeyParams::new(settings, frame.width, frame.height),
            reply,
        };
        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => Error::gpu("CPU keyer is busy"),
            TrySendError::Disconnected(_) => Error::gpu("CPU keyer worker stopped"),
        })?;
        Ok(Box::new(completion))
    }
}
