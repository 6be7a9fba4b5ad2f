//! Lua scripting plugin for VC:MP-compatible game servers. The host loads
//! this cdylib and calls [`VcmpPluginInit`] once; from then on every native
//! server event is forwarded to a script handler named `on_<event>`, with
//! faults absorbed so a broken script never takes the server down with it.

mod api;
mod config;
mod dispatch;
mod encoding;
mod events;
mod fault;
pub mod ffi;
mod marshal;
mod resolver;
mod runtime;

use std::path::Path;
use std::rc::Rc;

use ffi::{HostControl, PluginCallbacks, PluginFuncs, PluginInfo, ServerHandle};

pub use config::PluginConfig;
pub use dispatch::{signal_sender, ControlSignal, SignalSender};
pub use events::{EventSignature, ReturnKind, EVENTS};
pub use fault::{classify, FaultKind, InterruptRequested};
pub use runtime::{start, stop, StartError};

pub const PLUGIN_NAME: &str = "vclua";
pub const PLUGIN_VERSION: u32 = 0x0100;

/// Plugin entry point, called by the host exactly once at load time.
/// Returns 1 on success, 0 to abort the load.
///
/// # Safety
/// The host passes live, writable tables that outlive the plugin.
#[no_mangle]
pub unsafe extern "C" fn VcmpPluginInit(
    functions: *mut PluginFuncs,
    callbacks: *mut PluginCallbacks,
    info: *mut PluginInfo,
) -> u32 {
    if functions.is_null() || callbacks.is_null() || info.is_null() {
        return 0;
    }
    let Some(server) = ServerHandle::from_raw(functions) else {
        return 0;
    };
    (*info).fill(PLUGIN_NAME, PLUGIN_VERSION);
    let config = config::load(Path::new(config::CONFIG_FILE));
    let host: Rc<dyn HostControl> = Rc::new(server);
    if let Err(err) = runtime::start(host, Some(server), &config) {
        server.log_message(&format!("[script] failed to start: {err}"));
        return 0;
    }
    dispatch::register_callbacks(&mut *callbacks);
    1
}
