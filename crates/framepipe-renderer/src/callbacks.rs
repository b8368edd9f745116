use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use framepipe_channel::FrameBuffer;
use serde::Serialize;
use tracing::warn;

/// Error a frame callback may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type Handler = dyn Fn(&Arc<FrameBuffer>) -> Result<(), CallbackError> + Send + Sync;

/// Handle returned by `add_frame_callback`, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CallbackId(u64);

/// Ordered frame listeners.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    next_id: u64,
    entries: Vec<(CallbackId, Arc<Handler>)>,
}

impl CallbackRegistry {
    pub fn add<F>(&mut self, callback: F) -> CallbackId
    where
        F: Fn(&Arc<FrameBuffer>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = CallbackId(self.next_id);
        let handler: Arc<Handler> = Arc::new(callback);
        self.entries.push((id, handler));
        id
    }

    pub fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Handlers in registration order, detached from the registry so they can
    /// run without holding its lock.
    pub fn snapshot(&self) -> Vec<(CallbackId, Arc<Handler>)> {
        self.entries.clone()
    }
}

/// Invoke each handler with `frame`, isolating errors and panics.
///
/// Returns the number of handlers that failed.
pub(crate) fn dispatch(handlers: &[(CallbackId, Arc<Handler>)], frame: &Arc<FrameBuffer>) -> u64 {
    let mut failures = 0;
    for (id, handler) in handlers {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(frame))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                failures += 1;
                warn!(callback = ?id, frame = frame.frame_number(), error = %err, "frame callback failed");
            }
            Err(payload) => {
                failures += 1;
                warn!(
                    callback = ?id,
                    frame = frame.frame_number(),
                    panic = panic_message(payload.as_ref()),
                    "frame callback panicked"
                );
            }
        }
    }
    failures
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_channel::{Geometry, PixelFormat};
    use std::sync::Mutex;

    fn frame() -> Arc<FrameBuffer> {
        let geometry = Geometry::new(1, 1, PixelFormat::Bgra8888).unwrap();
        Arc::new(FrameBuffer::new(geometry, 4, 0, vec![0u8; 4]).unwrap())
    }

    #[test]
    fn failures_are_isolated_and_order_is_kept() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();

        let log = seen.clone();
        registry.add(move |_| {
            log.lock().unwrap().push("first");
            Err("first fails".into())
        });
        registry.add(|_| panic!("second panics"));
        let log = seen.clone();
        registry.add(move |frame| {
            log.lock().unwrap().push("third");
            assert_eq!(frame.frame_number(), 4);
            Ok(())
        });

        let failures = dispatch(&registry.snapshot(), &frame());
        assert_eq!(failures, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn remove_unregisters_only_that_callback() {
        let mut registry = CallbackRegistry::default();
        let first = registry.add(|_| Ok(()));
        let second = registry.add(|_| Ok(()));
        assert_ne!(first, second);

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].0, second);
    }
}
