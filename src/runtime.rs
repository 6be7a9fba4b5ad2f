//! Plugin lifecycle: one `start` wires logging, the interpreter, the script
//! surface and the bridge together; `stop` tears the bridge down. The entry
//! script is evaluated at start, and an error in it is reported but not
//! fatal, so an operator can fix the script without the server refusing to
//! boot.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use mlua::Lua;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::api;
use crate::config::PluginConfig;
use crate::dispatch::{self, Bridge};
use crate::ffi::{HostControl, ServerHandle};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
static FILTER_RELOAD: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum StartError {
    #[error("event bridge already started")]
    AlreadyStarted,
    #[error("failed to install script surface: {0}")]
    Install(#[from] mlua::Error),
}

/// Brings the bridge up: interpreter, `server` surface, dispatch slot, entry
/// script. Idempotence guard: a second `start` without a `stop` fails.
pub fn start(
    host: Rc<dyn HostControl>,
    server: Option<ServerHandle>,
    config: &PluginConfig,
) -> Result<(), StartError> {
    init_logging(config.debug);
    if dispatch::is_installed() {
        return Err(StartError::AlreadyStarted);
    }
    let lua = Lua::new();
    let bridge = Bridge::new(lua.clone(), host.clone());
    api::install(&lua, host.clone(), server, bridge.signal_sender())?;
    if !dispatch::install(bridge) {
        return Err(StartError::AlreadyStarted);
    }
    load_entry_script(&lua, host.as_ref(), &config.script);
    info!("script bridge started, entry script {}", config.script);
    Ok(())
}

/// Drops the bridge (and the interpreter with it). Trampolines left in the
/// host's callback table become inert. Returns whether anything was running.
pub fn stop() -> bool {
    dispatch::uninstall().is_some()
}

fn load_entry_script(lua: &Lua, host: &dyn HostControl, script: &str) {
    let source = match std::fs::read_to_string(script) {
        Ok(source) => source,
        Err(err) => {
            error!("cannot read entry script {script}: {err}");
            host.log(&format!("[script] cannot read entry script {script}: {err}"));
            return;
        }
    };
    if let Err(err) = lua.load(&source).set_name(script).exec() {
        error!("error in entry script {script}: {err}");
        host.log(&format!("[script] error in entry script {script}: {err}"));
    }
}

fn default_filter(debug: bool) -> EnvFilter {
    let fallback = if debug { "vclua=debug" } else { "vclua=info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

fn init_logging(debug: bool) {
    DEBUG_ENABLED.store(debug, Ordering::Relaxed);
    let (filter, handle) = reload::Layer::new(default_filter(debug));
    if tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
    {
        let _ = FILTER_RELOAD.set(handle);
    }
}

/// Runtime debug-log toggle, reachable from script via `server.set_debug`.
pub fn set_debug(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    if let Some(handle) = FILTER_RELOAD.get() {
        let _ = handle.reload(default_filter(enabled));
    }
}

pub fn debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}
