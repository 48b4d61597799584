use super::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::Notify;

/// Latched shutdown request, observed between polling cycles.
#[derive(Clone, Debug, Default)]
pub(crate) struct ShutdownLatch {
    inner: Arc<LatchInner>,
}

#[derive(Debug, Default)]
struct LatchInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownLatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        while !self.is_triggered() {
            self.inner.notify.notified().await;
        }
    }
}

pub(crate) fn spawn_signal_listener(latch: ShutdownLatch) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("termination signal caught, finishing current cycle");
        latch.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!("cannot listen for SIGTERM: {}", err);
            wait_for_ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = wait_for_ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
}

/// Runs the long-poll loop until a shutdown is latched or a fatal error
/// occurs. State is saved before returning in both cases.
pub(crate) async fn run_polling<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
) -> HandlerResult {
    loop {
        if app.shutdown.is_triggered() {
            info!("shutting down at offset {}", state.offset);
            app.store.save(state)?;
            return Ok(());
        }

        let fetched = tokio::select! {
            fetched = app.transport.fetch_updates(state.offset) => fetched,
            _ = app.shutdown.wait() => continue,
        };
        let batch = match fetched {
            Ok(batch) => batch,
            Err(err) if err.is_fatal() => {
                app.checkpoint(state);
                return Err(err.into());
            }
            Err(err) => {
                error!("fetching updates failed: {}", err);
                tokio::time::sleep(app.config.idle_delay).await;
                continue;
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(app.config.idle_delay).await;
            continue;
        }

        if let Err(err) = process_batch(app, state, batch).await {
            if err.is_fatal() {
                app.checkpoint(state);
                return Err(err);
            }
            error!(
                "cycle aborted at offset {}: {:#}",
                state.offset,
                anyhow::Error::new(err)
            );
        }
    }
}

/// Dispatches `batch` in order. The offset is advanced and saved before each
/// dispatch; updates below the offset are skipped.
pub(crate) async fn process_batch<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    batch: Vec<Update>,
) -> HandlerResult {
    for update in batch {
        if !state.advance_offset(update.id) {
            debug!("skipping already processed update {}", update.id);
            continue;
        }
        debug!("set offset to {}", state.offset);
        app.checkpoint(state);

        let result = dispatch_update(app, state, update.kind).await;
        app.checkpoint(state);
        result?;
    }
    Ok(())
}

async fn dispatch_update<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    kind: UpdateKind,
) -> HandlerResult {
    match kind {
        UpdateKind::Message(msg) => crate::message_handlers::handle_message(app, state, msg).await,
        UpdateKind::Callback(q) => crate::callback_handlers::handle_callback(app, state, q).await,
        UpdateKind::Unsupported => {
            debug!("no handler for update");
            Ok(())
        }
    }
}
