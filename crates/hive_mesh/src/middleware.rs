//! Interceptor pipeline run for every incoming call.
//!
//! Stages run in a fixed order: peer-wide data layers, peer-wide layers for
//! the communication kind, role-wide data layers, role-wide kind layers and
//! finally the event handlers. A layer runs until it calls [`Next::run`];
//! the next stage then starts, and the layer resumes once the exchange is
//! complete and every inner layer has resumed (onion order). A request or
//! stream completed by any stage skips the stages after it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::{Communication, Context};
use crate::error::Result;

/// A layer: receives the context and the continuation of the chain.
pub type Layer =
    Arc<dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A final handler for one event. An error that reaches the pipeline
/// rejects the call if nothing answered yet.
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

pub(crate) fn layer<F, Fut>(f: F) -> Layer
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, next| Box::pin(f(ctx, next)))
}

pub(crate) fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Layers registered at one scope (peer-wide or role-wide).
#[derive(Default)]
pub(crate) struct LayerSet {
    data: Vec<Layer>,
    by_kind: HashMap<Communication, Vec<Layer>>,
}

impl LayerSet {
    /// Add a layer for every kind (`None`) or for one kind.
    pub fn push(&mut self, kind: Option<Communication>, layer: Layer) {
        match kind {
            None => self.data.push(layer),
            Some(kind) => self.by_kind.entry(kind).or_default().push(layer),
        }
    }

    /// Data layers first, then the layers of `kind`.
    pub fn chain(&self, kind: Communication) -> Vec<Layer> {
        self.data
            .iter()
            .chain(self.by_kind.get(&kind).into_iter().flatten())
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.len() + self.by_kind.values().map(Vec::len).sum::<usize>()
    }
}

/// Continuation handed to a layer.
pub struct Next {
    suspend: oneshot::Sender<oneshot::Sender<()>>,
}

impl Next {
    /// Let the inner stages run; returns once the exchange is complete and
    /// every inner layer has resumed. Returns at once if the exchange was
    /// already completed.
    pub async fn run(self) {
        let (resume_tx, resume_rx) = oneshot::channel();
        if self.suspend.send(resume_tx).is_ok() {
            let _ = resume_rx.await;
        }
    }
}

enum Step {
    Suspended(oneshot::Sender<()>),
    NextDropped,
    Finished,
    Completed,
}

/// Run the pipeline to completion: every stage, then the unwinding of the
/// suspended layers. The caller sends the answer afterwards.
pub(crate) async fn drive(ctx: Context, layers: Vec<Layer>, handlers: Vec<Handler>) {
    let mut completed = ctx.completed();
    let mut suspended: Vec<(oneshot::Sender<()>, JoinHandle<()>)> = Vec::new();

    let mut handlers = Some(handlers);
    let stages = layers.into_iter().map(Some).chain(std::iter::once(None));

    for stage in stages {
        if *completed.borrow() {
            break;
        }
        let (next_tx, mut next_rx) = oneshot::channel();
        let mut task = match stage {
            Some(layer) => tokio::spawn(layer(ctx.clone(), Next { suspend: next_tx })),
            None => {
                drop(next_tx);
                let handlers = handlers.take().unwrap_or_default();
                tokio::spawn(run_handlers(ctx.clone(), handlers))
            }
        };
        let mut next_open = true;

        let step = loop {
            let step = tokio::select! {
                resume = &mut next_rx, if next_open => match resume {
                    Ok(resume_tx) => Step::Suspended(resume_tx),
                    Err(_) => Step::NextDropped,
                },
                _ = &mut task => Step::Finished,
                _ = completed.wait_for(|done| *done) => Step::Completed,
            };
            match step {
                Step::NextDropped => next_open = false,
                other => break other,
            }
        };

        match step {
            Step::Suspended(resume_tx) => suspended.push((resume_tx, task)),
            Step::Finished => {}
            // The stage keeps running detached; it is not part of the unwind.
            Step::Completed | Step::NextDropped => break,
        }
    }

    if ctx.kind() == Communication::Message {
        ctx.finish_message();
    } else if !*completed.borrow() {
        let unit = Arc::clone(ctx.unit());
        tokio::select! {
            _ = completed.wait_for(|done| *done) => {}
            _ = unit.closed() => {
                debug!("Unit {} closed before {} \"{}\" was answered", unit.id(), ctx.kind(), ctx.event());
            }
        }
    }

    while let Some((resume_tx, task)) = suspended.pop() {
        let _ = resume_tx.send(());
        if let Err(e) = task.await {
            warn!("Layer for \"{}\" panicked: {e}", ctx.event());
        }
    }
}

async fn run_handlers(ctx: Context, handlers: Vec<Handler>) {
    for handler in handlers {
        if let Err(e) = handler(ctx.clone()).await {
            if ctx.kind().expects_answer() {
                if ctx.reject(e.to_string()).is_err() {
                    debug!("Handler for \"{}\" failed after answering: {e}", ctx.event());
                }
            } else {
                warn!("Message handler for \"{}\" failed: {e}", ctx.event());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::error::MeshError;
    use crate::protocol::Payload;
    use crate::unit::Unit;

    fn context(kind: Communication) -> Context {
        Context::new(
            kind,
            Unit::detached("remote"),
            "role".into(),
            "event".into(),
            Payload::Null.into(),
        )
    }

    fn appending(ctx: &Context, suffix: &str) {
        let current = ctx.response().as_str().unwrap_or_default().to_string();
        ctx.set_response(format!("{current}{suffix}"));
    }

    fn onion(tag: &'static str) -> Layer {
        layer(move |ctx: Context, next: Next| async move {
            appending(&ctx, tag);
            next.run().await;
            appending(&ctx, tag);
        })
    }

    #[tokio::test]
    async fn test_layers_unwind_in_reverse_order() {
        let ctx = context(Communication::Request);
        let answer = handler(|ctx: Context| async move {
            let current = ctx.response().as_str().unwrap_or_default().to_string();
            ctx.reply(format!("{current}5"))
        });
        let layers = vec![onion("1"), onion("2"), onion("3"), onion("4")];

        tokio::time::timeout(Duration::from_secs(2), drive(ctx.clone(), layers, vec![answer]))
            .await
            .unwrap();
        assert_eq!(ctx.response(), Payload::from("123454321"));
    }

    #[tokio::test]
    async fn test_completion_skips_remaining_stages() {
        let ctx = context(Communication::Request);
        let reached = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let reached = Arc::clone(&reached);
            layer(move |ctx: Context, _next: Next| {
                let reached = Arc::clone(&reached);
                async move {
                    reached.lock().push("first");
                    ctx.reply("early").unwrap();
                }
            })
        };
        let second = {
            let reached = Arc::clone(&reached);
            layer(move |_ctx: Context, next: Next| {
                let reached = Arc::clone(&reached);
                async move {
                    reached.lock().push("second");
                    next.run().await;
                }
            })
        };
        let never = {
            let reached = Arc::clone(&reached);
            handler(move |_ctx: Context| {
                let reached = Arc::clone(&reached);
                async move {
                    reached.lock().push("handler");
                    Ok(())
                }
            })
        };

        tokio::time::timeout(
            Duration::from_secs(2),
            drive(ctx.clone(), vec![first, second], vec![never]),
        )
        .await
        .unwrap();
        assert_eq!(*reached.lock(), vec!["first"]);
        assert_eq!(ctx.response(), Payload::from("early"));
    }

    #[tokio::test]
    async fn test_messages_run_every_stage() {
        let ctx = context(Communication::Message);
        let count = Arc::new(Mutex::new(0));
        let counting = |count: Arc<Mutex<i32>>| {
            layer(move |_ctx: Context, next: Next| {
                let count = Arc::clone(&count);
                async move {
                    *count.lock() += 1;
                    next.run().await;
                }
            })
        };
        let last = {
            let count = Arc::clone(&count);
            handler(move |_ctx: Context| {
                let count = Arc::clone(&count);
                async move {
                    *count.lock() += 1;
                    Ok(())
                }
            })
        };

        drive(
            ctx.clone(),
            vec![counting(Arc::clone(&count)), counting(Arc::clone(&count))],
            vec![last],
        )
        .await;
        assert_eq!(*count.lock(), 3);
        assert!(matches!(ctx.reply("x"), Err(MeshError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_handler_error_rejects() {
        let ctx = context(Communication::Request);
        let failing = handler(|_ctx: Context| async move {
            Err(MeshError::Remote("boom".into()))
        });
        drive(ctx.clone(), Vec::new(), vec![failing]).await;
        assert_eq!(ctx.error().as_deref(), Some("boom"));
        assert!(ctx.is_responded());
    }

    #[tokio::test]
    async fn test_second_answer_is_refused() {
        let ctx = context(Communication::Request);
        ctx.reply(1).unwrap();
        assert!(matches!(ctx.reply(2), Err(MeshError::AlreadyResponded)));
        assert!(matches!(ctx.reject("no"), Err(MeshError::AlreadyResponded)));
        assert_eq!(ctx.response(), Payload::from(1));
        assert_eq!(ctx.error(), None);
    }

    #[test]
    fn test_layer_set_orders_data_first() {
        let mut set = LayerSet::default();
        set.push(Some(Communication::Request), onion("r"));
        set.push(None, onion("d"));
        set.push(Some(Communication::Message), onion("m"));
        assert_eq!(set.len(), 3);
        assert_eq!(set.chain(Communication::Request).len(), 2);
        assert_eq!(set.chain(Communication::Readable).len(), 1);
    }

    #[tokio::test]
    async fn test_layer_set_chain_runs_in_registration_order() {
        let mut set = LayerSet::default();
        set.push(Some(Communication::Request), onion("b"));
        set.push(None, onion("a"));
        let ctx = context(Communication::Request);
        let answer = handler(|ctx: Context| async move {
            let current = ctx.response().as_str().unwrap_or_default().to_string();
            ctx.reply(current)
        });
        drive(ctx.clone(), set.chain(Communication::Request), vec![answer]).await;
        assert_eq!(ctx.response(), Payload::from("abba"));
    }

    #[tokio::test]
    async fn test_layer_without_next_does_not_stall() {
        let ctx = context(Communication::Request);
        let silent = layer(|_ctx: Context, _next: Next| async move {});
        let answer = handler(|ctx: Context| async move { ctx.reply("done") });
        tokio::time::timeout(
            Duration::from_secs(2),
            drive(ctx.clone(), vec![silent], vec![answer]),
        )
        .await
        .unwrap();
        assert_eq!(ctx.response(), Payload::from("done"));
    }
}
