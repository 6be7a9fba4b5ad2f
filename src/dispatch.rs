//! The bridge between the host's callback table and script handlers. One
//! `Bridge` lives in a thread-local slot on the dispatch thread; every
//! `extern "C"` trampoline funnels through the generic notify/gate helpers,
//! which guard the script call and absorb faults so the host never unwinds.
//!
//! Re-entrancy: a handler may call back into the native surface, which may
//! fire another event synchronously. The bridge borrow is therefore never
//! held across a script call; each dispatch clones the cheap handles it
//! needs up front and releases the slot before entering Lua.

use std::cell::RefCell;
use std::os::raw::c_char;
use std::rc::Rc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mlua::{Function, IntoLuaMulti, Lua, RegistryKey, Value};
use tracing::{debug, error, info};

use crate::events::{self, DEFAULT_DENY};
use crate::fault::{self, FaultKind};
use crate::ffi::{HostControl, PluginCallbacks};
use crate::marshal::{self, ConnectionDecision};
use crate::resolver::HandlerResolver;

/// Cap on queued control signals executed per frame tick, so a producer
/// cannot starve event dispatch.
const MAX_SIGNALS_PER_FRAME: usize = 64;

/// Work queued from other threads, executed on the dispatch thread during
/// the frame tick.
pub enum ControlSignal {
    /// Run a Lua callable previously parked in the registry.
    Invoke(RegistryKey),
    /// Escalate as if a script had requested shutdown.
    Shutdown,
}

/// Cloneable, `Send` producer half of the control-signal queue. The only way
/// background threads may reach script execution.
#[derive(Clone)]
pub struct SignalSender {
    tx: Sender<ControlSignal>,
}

impl SignalSender {
    pub fn send(&self, signal: ControlSignal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.send(ControlSignal::Shutdown)
    }
}

pub struct Bridge {
    lua: Lua,
    resolver: HandlerResolver,
    host: Rc<dyn HostControl>,
    signal_tx: Sender<ControlSignal>,
    signals: Receiver<ControlSignal>,
    halted: bool,
}

impl Bridge {
    pub fn new(lua: Lua, host: Rc<dyn HostControl>) -> Self {
        let resolver = HandlerResolver::new(&lua);
        let (signal_tx, signals) = unbounded();
        Self {
            lua,
            resolver,
            host,
            signal_tx,
            signals,
            halted: false,
        }
    }

    pub fn signal_sender(&self) -> SignalSender {
        SignalSender {
            tx: self.signal_tx.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_signals(&self) -> usize {
        self.signals.len()
    }
}

thread_local! {
    static BRIDGE: RefCell<Option<Bridge>> = const { RefCell::new(None) };
}

pub fn install(bridge: Bridge) -> bool {
    BRIDGE.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return false;
        }
        *slot = Some(bridge);
        true
    })
}

pub fn uninstall() -> Option<Bridge> {
    BRIDGE.with(|slot| slot.borrow_mut().take())
}

pub fn is_installed() -> bool {
    BRIDGE.with(|slot| slot.borrow().is_some())
}

fn with<R>(f: impl FnOnce(&mut Bridge) -> R) -> Option<R> {
    BRIDGE.with(|slot| slot.borrow_mut().as_mut().map(f))
}

pub fn signal_sender() -> Option<SignalSender> {
    with(|bridge| bridge.signal_sender())
}

/// Per-dispatch handles cloned out of the bridge slot while the borrow is
/// held, used after it is released.
struct DispatchCtx {
    lua: Lua,
    handler: Option<Function>,
    host: Rc<dyn HostControl>,
}

/// Resolves the handler for one dispatch. `None` when no bridge is installed
/// or the bridge has halted; the caller completes with its default.
fn begin(event: &str) -> Option<DispatchCtx> {
    with(|bridge| {
        if bridge.halted {
            return None;
        }
        let handler = bridge.resolver.resolve(&bridge.lua, event);
        Some(DispatchCtx {
            lua: bridge.lua.clone(),
            handler,
            host: bridge.host.clone(),
        })
    })
    .flatten()
}

/// Marks the bridge halted and issues the single forced-shutdown request.
/// Later dispatches no-op; a second interrupt changes nothing.
fn halt(host: &Rc<dyn HostControl>) {
    let first = with(|bridge| {
        let was_halted = bridge.halted;
        bridge.halted = true;
        !was_halted
    })
    .unwrap_or(false);
    if first {
        info!("shutdown requested from script, halting event dispatch");
        host.request_shutdown();
    }
}

fn absorb(event: &str, err: mlua::Error, host: &Rc<dyn HostControl>) {
    match fault::classify(&err) {
        FaultKind::Interrupt => halt(host),
        FaultKind::Script(message) => {
            error!("script error in {event}: {message}");
            host.log(&format!("[script] error in {event}: {message}"));
        }
        FaultKind::Unknown(message) => {
            error!("interpreter failure in {event}: {message}");
            host.log(&format!("[script] interpreter failure in {event}: {message}"));
        }
    }
}

/// Guarded fire-and-forget dispatch. `build` assembles the handler arguments
/// against the live interpreter.
pub fn dispatch_notify<A: IntoLuaMulti>(
    event: &'static str,
    build: impl FnOnce(&Lua) -> mlua::Result<A>,
) {
    dispatch_value(event, build);
}

/// Guarded dispatch returning the handler's raw result. `None` when the
/// bridge is down, the handler is unbound, or the call faulted (absorbed).
fn dispatch_value<A: IntoLuaMulti>(
    event: &'static str,
    build: impl FnOnce(&Lua) -> mlua::Result<A>,
) -> Option<Value> {
    let ctx = begin(event)?;
    let handler = ctx.handler.clone()?;
    let args = match build(&ctx.lua) {
        Ok(args) => args,
        Err(err) => {
            absorb(event, err, &ctx.host);
            return None;
        }
    };
    match handler.call::<Value>(args) {
        Ok(value) => Some(value),
        Err(err) => {
            absorb(event, err, &ctx.host);
            None
        }
    }
}

/// Guarded dispatch for gating events: the handler's result is coerced to
/// the native allow/deny code, faults fall back to the event's default from
/// the signature table.
pub fn dispatch_gate<A: IntoLuaMulti>(
    event: &'static str,
    build: impl FnOnce(&Lua) -> mlua::Result<A>,
) -> u8 {
    let default = events::default_return(event);
    match dispatch_value(event, build) {
        Some(value) => marshal::gate_result(event, &value, default),
        None => default,
    }
}

/// Frame tick: runs `on_server_frame`, then drains queued control signals.
/// The drain is bounded per tick and stops immediately once halted.
pub fn dispatch_frame(elapsed_time: f32) {
    dispatch_notify("server_frame", |_| Ok(elapsed_time));
    process_control_signals();
}

fn process_control_signals() {
    let Some((lua, host, signals)) =
        with(|b| (b.lua.clone(), b.host.clone(), b.signals.clone()))
    else {
        return;
    };
    for _ in 0..MAX_SIGNALS_PER_FRAME {
        if with(|b| b.halted).unwrap_or(true) {
            return;
        }
        match signals.try_recv() {
            Ok(ControlSignal::Invoke(key)) => {
                let callable = lua.registry_value::<Function>(&key);
                let _ = lua.remove_registry_value(key);
                match callable {
                    Ok(callable) => {
                        if let Err(err) = callable.call::<()>(()) {
                            absorb("control_signal", err, &host);
                        }
                    }
                    Err(err) => debug!("stale control signal dropped: {err}"),
                }
            }
            Ok(ControlSignal::Shutdown) => {
                halt(&host);
                return;
            }
            Err(_) => return,
        }
    }
}

/// Load-time gate. The one event where a fault aborts the plugin: any error
/// in `on_server_initialise` reports failure to the host loader.
pub fn dispatch_initialise() -> u8 {
    let default = events::default_return("server_initialise");
    let Some(ctx) = begin("server_initialise") else {
        return DEFAULT_DENY;
    };
    let Some(handler) = ctx.handler.clone() else {
        return default;
    };
    match handler.call::<Value>(()) {
        Ok(value) => marshal::gate_result("server_initialise", &value, default),
        Err(err) => {
            absorb("server_initialise", err, &ctx.host);
            DEFAULT_DENY
        }
    }
}

/// Shutdown notification plus interpreter teardown. Safe even if the handler
/// faults or the bridge already halted; the Lua state is dropped either way.
pub fn dispatch_shutdown() {
    dispatch_notify("server_shutdown", |_| Ok(()));
    if uninstall().is_some() {
        debug!("interpreter torn down");
    }
}

/// Fills every callback slot. Called exactly once, from plugin init.
pub fn register_callbacks(callbacks: &mut PluginCallbacks) {
    callbacks.on_server_initialise = Some(on_server_initialise);
    callbacks.on_server_shutdown = Some(on_server_shutdown);
    callbacks.on_server_frame = Some(on_server_frame);
    callbacks.on_plugin_command = Some(on_plugin_command);
    callbacks.on_incoming_connection = Some(on_incoming_connection);
    callbacks.on_client_script_data = Some(on_client_script_data);
    callbacks.on_player_connect = Some(on_player_connect);
    callbacks.on_player_disconnect = Some(on_player_disconnect);
    callbacks.on_player_request_class = Some(on_player_request_class);
    callbacks.on_player_request_spawn = Some(on_player_request_spawn);
    callbacks.on_player_spawn = Some(on_player_spawn);
    callbacks.on_player_death = Some(on_player_death);
    callbacks.on_player_update = Some(on_player_update);
    callbacks.on_player_request_enter_vehicle = Some(on_player_request_enter_vehicle);
    callbacks.on_player_enter_vehicle = Some(on_player_enter_vehicle);
    callbacks.on_player_exit_vehicle = Some(on_player_exit_vehicle);
    callbacks.on_player_name_change = Some(on_player_name_change);
    callbacks.on_player_state_change = Some(on_player_state_change);
    callbacks.on_player_action_change = Some(on_player_action_change);
    callbacks.on_player_on_fire_change = Some(on_player_on_fire_change);
    callbacks.on_player_crouch_change = Some(on_player_crouch_change);
    callbacks.on_player_game_keys_change = Some(on_player_game_keys_change);
    callbacks.on_player_begin_typing = Some(on_player_begin_typing);
    callbacks.on_player_end_typing = Some(on_player_end_typing);
    callbacks.on_player_away_change = Some(on_player_away_change);
    callbacks.on_player_message = Some(on_player_message);
    callbacks.on_player_command = Some(on_player_command);
    callbacks.on_player_private_message = Some(on_player_private_message);
    callbacks.on_player_key_bind_down = Some(on_player_key_bind_down);
    callbacks.on_player_key_bind_up = Some(on_player_key_bind_up);
    callbacks.on_player_spectate = Some(on_player_spectate);
    callbacks.on_player_crash_report = Some(on_player_crash_report);
    callbacks.on_vehicle_update = Some(on_vehicle_update);
    callbacks.on_vehicle_explode = Some(on_vehicle_explode);
    callbacks.on_vehicle_respawn = Some(on_vehicle_respawn);
    callbacks.on_object_shot = Some(on_object_shot);
    callbacks.on_object_touched = Some(on_object_touched);
    callbacks.on_pickup_pick_attempt = Some(on_pickup_pick_attempt);
    callbacks.on_pickup_picked = Some(on_pickup_picked);
    callbacks.on_pickup_respawn = Some(on_pickup_respawn);
    callbacks.on_checkpoint_entered = Some(on_checkpoint_entered);
    callbacks.on_checkpoint_exited = Some(on_checkpoint_exited);
    callbacks.on_entity_pool_change = Some(on_entity_pool_change);
    callbacks.on_server_performance_report = Some(on_server_performance_report);
    callbacks.on_player_module_list = Some(on_player_module_list);
}

// Trampolines. Pointer arguments are marshaled before entering the guarded
// helpers so the arg-builder closures stay safe code.

unsafe extern "C" fn on_server_initialise() -> u8 {
    dispatch_initialise()
}

unsafe extern "C" fn on_server_shutdown() {
    dispatch_shutdown();
}

unsafe extern "C" fn on_server_frame(elapsed_time: f32) {
    dispatch_frame(elapsed_time);
}

unsafe extern "C" fn on_plugin_command(command_identifier: u32, message: *const c_char) -> u8 {
    let message = marshal::text_arg(message);
    dispatch_gate("plugin_command", move |_| {
        Ok((command_identifier, message))
    })
}

unsafe extern "C" fn on_incoming_connection(
    player_name: *mut c_char,
    name_buffer_size: usize,
    user_password: *const c_char,
    ip_address: *const c_char,
) -> u8 {
    let default = events::default_return("incoming_connection");
    let name = marshal::text_arg(player_name as *const c_char);
    let password = marshal::text_arg(user_password);
    let ip = marshal::text_arg(ip_address);
    // The host reserves one byte for the terminator.
    let name_budget = name_buffer_size.saturating_sub(1);
    let value = dispatch_value("incoming_connection", move |_| {
        Ok((name, name_budget, password, ip))
    });
    match value {
        Some(value) => {
            match marshal::connection_result("incoming_connection", &value, default) {
                ConnectionDecision::Gate(code) => code,
                ConnectionDecision::Rename(new_name) => {
                    marshal::write_name_buffer(player_name, name_buffer_size, &new_name);
                    default
                }
            }
        }
        None => default,
    }
}

unsafe extern "C" fn on_client_script_data(player_id: i32, data: *const u8, size: usize) {
    let payload: Vec<u8> = if data.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data, size).to_vec()
    };
    dispatch_notify("client_script_data", move |lua| {
        Ok((player_id, lua.create_string(&payload)?))
    });
}

unsafe extern "C" fn on_player_connect(player_id: i32) {
    dispatch_notify("player_connect", move |_| Ok(player_id));
}

unsafe extern "C" fn on_player_disconnect(player_id: i32, reason: i32) {
    dispatch_notify("player_disconnect", move |_| Ok((player_id, reason)));
}

unsafe extern "C" fn on_player_request_class(player_id: i32, offset: i32) -> u8 {
    dispatch_gate("player_request_class", move |_| Ok((player_id, offset)))
}

unsafe extern "C" fn on_player_request_spawn(player_id: i32) -> u8 {
    dispatch_gate("player_request_spawn", move |_| Ok(player_id))
}

unsafe extern "C" fn on_player_spawn(player_id: i32) {
    dispatch_notify("player_spawn", move |_| Ok(player_id));
}

unsafe extern "C" fn on_player_death(player_id: i32, killer_id: i32, reason: i32, body_part: i32) {
    dispatch_notify("player_death", move |_| {
        Ok((player_id, killer_id, reason, body_part))
    });
}

unsafe extern "C" fn on_player_update(player_id: i32, update_type: i32) {
    dispatch_notify("player_update", move |_| Ok((player_id, update_type)));
}

unsafe extern "C" fn on_player_request_enter_vehicle(
    player_id: i32,
    vehicle_id: i32,
    slot_index: i32,
) -> u8 {
    dispatch_gate("player_request_enter_vehicle", move |_| {
        Ok((player_id, vehicle_id, slot_index))
    })
}

unsafe extern "C" fn on_player_enter_vehicle(player_id: i32, vehicle_id: i32, slot_index: i32) {
    dispatch_notify("player_enter_vehicle", move |_| {
        Ok((player_id, vehicle_id, slot_index))
    });
}

unsafe extern "C" fn on_player_exit_vehicle(player_id: i32, vehicle_id: i32) {
    dispatch_notify("player_exit_vehicle", move |_| Ok((player_id, vehicle_id)));
}

unsafe extern "C" fn on_player_name_change(
    player_id: i32,
    old_name: *const c_char,
    new_name: *const c_char,
) {
    let old_name = marshal::text_arg(old_name);
    let new_name = marshal::text_arg(new_name);
    dispatch_notify("player_name_change", move |_| {
        Ok((player_id, old_name, new_name))
    });
}

unsafe extern "C" fn on_player_state_change(player_id: i32, old_state: i32, new_state: i32) {
    dispatch_notify("player_state_change", move |_| {
        Ok((player_id, old_state, new_state))
    });
}

unsafe extern "C" fn on_player_action_change(player_id: i32, old_action: i32, new_action: i32) {
    dispatch_notify("player_action_change", move |_| {
        Ok((player_id, old_action, new_action))
    });
}

unsafe extern "C" fn on_player_on_fire_change(player_id: i32, is_on_fire: u8) {
    dispatch_notify("player_on_fire_change", move |_| {
        Ok((player_id, is_on_fire != 0))
    });
}

unsafe extern "C" fn on_player_crouch_change(player_id: i32, is_crouching: u8) {
    dispatch_notify("player_crouch_change", move |_| {
        Ok((player_id, is_crouching != 0))
    });
}

unsafe extern "C" fn on_player_game_keys_change(player_id: i32, old_keys: u32, new_keys: u32) {
    dispatch_notify("player_game_keys_change", move |_| {
        Ok((player_id, old_keys, new_keys))
    });
}

unsafe extern "C" fn on_player_begin_typing(player_id: i32) {
    dispatch_notify("player_begin_typing", move |_| Ok(player_id));
}

unsafe extern "C" fn on_player_end_typing(player_id: i32) {
    dispatch_notify("player_end_typing", move |_| Ok(player_id));
}

unsafe extern "C" fn on_player_away_change(player_id: i32, is_away: u8) {
    dispatch_notify("player_away_change", move |_| Ok((player_id, is_away != 0)));
}

unsafe extern "C" fn on_player_message(player_id: i32, message: *const c_char) -> u8 {
    let message = marshal::text_arg(message);
    dispatch_gate("player_message", move |_| Ok((player_id, message)))
}

unsafe extern "C" fn on_player_command(player_id: i32, message: *const c_char) -> u8 {
    let message = marshal::text_arg(message);
    dispatch_gate("player_command", move |_| Ok((player_id, message)))
}

unsafe extern "C" fn on_player_private_message(
    player_id: i32,
    target_player_id: i32,
    message: *const c_char,
) -> u8 {
    let message = marshal::text_arg(message);
    dispatch_gate("player_private_message", move |_| {
        Ok((player_id, target_player_id, message))
    })
}

unsafe extern "C" fn on_player_key_bind_down(player_id: i32, bind_id: i32) {
    dispatch_notify("player_key_bind_down", move |_| Ok((player_id, bind_id)));
}

unsafe extern "C" fn on_player_key_bind_up(player_id: i32, bind_id: i32) {
    dispatch_notify("player_key_bind_up", move |_| Ok((player_id, bind_id)));
}

unsafe extern "C" fn on_player_spectate(player_id: i32, target_player_id: i32) {
    dispatch_notify("player_spectate", move |_| {
        Ok((player_id, target_player_id))
    });
}

unsafe extern "C" fn on_player_crash_report(player_id: i32, report: *const c_char) {
    let report = marshal::text_arg(report);
    dispatch_notify("player_crash_report", move |_| Ok((player_id, report)));
}

unsafe extern "C" fn on_vehicle_update(vehicle_id: i32, update_type: i32) {
    dispatch_notify("vehicle_update", move |_| Ok((vehicle_id, update_type)));
}

unsafe extern "C" fn on_vehicle_explode(vehicle_id: i32) {
    dispatch_notify("vehicle_explode", move |_| Ok(vehicle_id));
}

unsafe extern "C" fn on_vehicle_respawn(vehicle_id: i32) {
    dispatch_notify("vehicle_respawn", move |_| Ok(vehicle_id));
}

unsafe extern "C" fn on_object_shot(object_id: i32, player_id: i32, weapon_id: i32) {
    dispatch_notify("object_shot", move |_| Ok((object_id, player_id, weapon_id)));
}

unsafe extern "C" fn on_object_touched(object_id: i32, player_id: i32) {
    dispatch_notify("object_touched", move |_| Ok((object_id, player_id)));
}

unsafe extern "C" fn on_pickup_pick_attempt(pickup_id: i32, player_id: i32) -> u8 {
    dispatch_gate("pickup_pick_attempt", move |_| Ok((pickup_id, player_id)))
}

unsafe extern "C" fn on_pickup_picked(pickup_id: i32, player_id: i32) {
    dispatch_notify("pickup_picked", move |_| Ok((pickup_id, player_id)));
}

unsafe extern "C" fn on_pickup_respawn(pickup_id: i32) {
    dispatch_notify("pickup_respawn", move |_| Ok(pickup_id));
}

unsafe extern "C" fn on_checkpoint_entered(checkpoint_id: i32, player_id: i32) {
    dispatch_notify("checkpoint_entered", move |_| Ok((checkpoint_id, player_id)));
}

unsafe extern "C" fn on_checkpoint_exited(checkpoint_id: i32, player_id: i32) {
    dispatch_notify("checkpoint_exited", move |_| Ok((checkpoint_id, player_id)));
}

unsafe extern "C" fn on_entity_pool_change(entity_type: i32, entity_id: i32, is_deleted: u8) {
    dispatch_notify("entity_pool_change", move |_| {
        Ok((entity_type, entity_id, is_deleted != 0))
    });
}

unsafe extern "C" fn on_server_performance_report(
    entry_count: usize,
    descriptions: *mut *const c_char,
    times: *mut u64,
) {
    let mut entries = Vec::with_capacity(entry_count);
    if !descriptions.is_null() && !times.is_null() {
        for i in 0..entry_count {
            entries.push((marshal::text_arg(*descriptions.add(i)), *times.add(i)));
        }
    }
    dispatch_notify("server_performance_report", move |lua| {
        marshal::performance_report(lua, &entries)
    });
}

unsafe extern "C" fn on_player_module_list(player_id: i32, list: *const c_char) {
    let list = marshal::text_arg(list);
    dispatch_notify("player_module_list", move |_| Ok((player_id, list)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::ffi::CString;

    struct MockHost {
        logs: RefCell<Vec<String>>,
        shutdowns: Cell<u32>,
    }

    impl MockHost {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                logs: RefCell::new(Vec::new()),
                shutdowns: Cell::new(0),
            })
        }
    }

    impl HostControl for MockHost {
        fn log(&self, line: &str) {
            self.logs.borrow_mut().push(line.to_owned());
        }

        fn request_shutdown(&self) {
            self.shutdowns.set(self.shutdowns.get() + 1);
        }
    }

    struct Installed;

    impl Drop for Installed {
        fn drop(&mut self) {
            uninstall();
        }
    }

    fn start_bridge(script: &str) -> (Lua, Rc<MockHost>, Installed) {
        let host = MockHost::new();
        let lua = Lua::new();
        let bridge = Bridge::new(lua.clone(), host.clone());
        let sender = bridge.signal_sender();
        crate::api::install(&lua, host.clone(), None, sender).expect("api install");
        assert!(install(bridge));
        if !script.is_empty() {
            lua.load(script).exec().expect("script load");
        }
        (lua, host, Installed)
    }

    #[test]
    fn unhandled_gate_events_allow_and_bind_the_noop() {
        let (lua, _host, _guard) = start_bridge("");
        let code = unsafe { on_pickup_pick_attempt(3, 5) };
        assert_eq!(code, 1);
        let bound: Value = lua.globals().get("on_pickup_pick_attempt").expect("global");
        assert!(matches!(bound, Value::Function(_)));
    }

    #[test]
    fn unhandled_connection_defaults_to_allow() {
        let (_lua, _host, _guard) = start_bridge("");
        let mut name = *b"Tommy\0\0\0\0\0\0\0\0\0\0\0";
        let password = CString::new("").expect("cstr");
        let ip = CString::new("127.0.0.1").expect("cstr");
        let code = unsafe {
            on_incoming_connection(
                name.as_mut_ptr() as *mut c_char,
                name.len(),
                password.as_ptr(),
                ip.as_ptr(),
            )
        };
        assert_eq!(code, 1);
        assert_eq!(&name[..6], b"Tommy\0");
    }

    #[test]
    fn gate_handlers_deny_with_false() {
        let (_lua, _host, _guard) = start_bridge(
            "function on_player_message(id, text) return text ~= 'spam' end",
        );
        let spam = CString::new("spam").expect("cstr");
        let fine = CString::new("hello").expect("cstr");
        assert_eq!(unsafe { on_player_message(1, spam.as_ptr()) }, 0);
        assert_eq!(unsafe { on_player_message(1, fine.as_ptr()) }, 1);
    }

    #[test]
    fn connection_handler_can_rewrite_the_name() {
        let (_lua, _host, _guard) =
            start_bridge("function on_incoming_connection(name, max, pass, ip) return '[EU]' .. name end");
        let mut buffer = [0u8; 12];
        buffer[..5].copy_from_slice(b"Tommy");
        let password = CString::new("").expect("cstr");
        let ip = CString::new("10.0.0.1").expect("cstr");
        let code = unsafe {
            on_incoming_connection(
                buffer.as_mut_ptr() as *mut c_char,
                buffer.len(),
                password.as_ptr(),
                ip.as_ptr(),
            )
        };
        assert_eq!(code, 1);
        assert_eq!(&buffer[..10], b"[EU]Tommy\0");
    }

    #[test]
    fn connection_rename_never_overflows_the_buffer() {
        let (_lua, _host, _guard) = start_bridge(
            "function on_incoming_connection(name, max, pass, ip) return 'AVeryLongReplacementName' end",
        );
        let mut buffer = [0x7Fu8; 8];
        let password = CString::new("").expect("cstr");
        let ip = CString::new("10.0.0.1").expect("cstr");
        unsafe {
            on_incoming_connection(
                buffer.as_mut_ptr() as *mut c_char,
                buffer.len(),
                password.as_ptr(),
                ip.as_ptr(),
            )
        };
        assert_eq!(&buffer[..8], b"AVeryLo\0");
    }

    #[test]
    fn a_faulting_handler_leaves_later_dispatches_working() {
        let (lua, host, _guard) = start_bridge(
            "count = 0\n\
             function on_player_spawn(id) error('boom') end\n\
             function on_player_connect(id) count = count + 1 end",
        );
        unsafe { on_player_spawn(1) };
        assert_eq!(host.shutdowns.get(), 0);
        assert!(host.logs.borrow()[0].contains("boom"));
        for id in 0..5 {
            unsafe { on_player_connect(id) };
        }
        assert_eq!(lua.globals().get::<i32>("count").expect("count"), 5);
    }

    #[test]
    fn interrupt_shuts_down_once_and_halts_dispatch() {
        let (lua, host, _guard) = start_bridge(
            "count = 0\n\
             function on_player_connect(id) count = count + 1 end\n\
             function on_player_command(id, text) server.exit() end",
        );
        let cmd = CString::new("quit").expect("cstr");
        assert_eq!(unsafe { on_player_command(1, cmd.as_ptr()) }, 1);
        assert_eq!(host.shutdowns.get(), 1);
        unsafe { on_player_connect(1) };
        assert_eq!(lua.globals().get::<i32>("count").expect("count"), 0);
        // A second interrupt attempt cannot reach script space at all.
        assert_eq!(unsafe { on_player_command(1, cmd.as_ptr()) }, 1);
        assert_eq!(host.shutdowns.get(), 1);
    }

    #[test]
    fn integers_round_trip_bit_for_bit() {
        let (lua, _host, _guard) = start_bridge(
            "function on_player_disconnect(id, reason) seen_id = id; seen_reason = reason end",
        );
        for value in [0i32, 1, -1, i32::MAX, i32::MIN] {
            unsafe { on_player_disconnect(value, -1) };
            assert_eq!(lua.globals().get::<i32>("seen_id").expect("id"), value);
        }
        assert_eq!(lua.globals().get::<i32>("seen_reason").expect("reason"), -1);
    }

    #[test]
    fn flag_arguments_marshal_to_booleans() {
        let (lua, _host, _guard) =
            start_bridge("function on_player_away_change(id, away) seen_away = away end");
        unsafe { on_player_away_change(1, 1) };
        assert!(lua.globals().get::<bool>("seen_away").expect("away"));
        unsafe { on_player_away_change(1, 0) };
        assert!(!lua.globals().get::<bool>("seen_away").expect("away"));
    }

    #[test]
    fn events_arrive_in_emission_order() {
        let (lua, _host, _guard) = start_bridge(
            "order = {}\n\
             function on_player_connect(id) order[#order + 1] = 'connect' .. id end\n\
             function on_player_spawn(id) order[#order + 1] = 'spawn' .. id end",
        );
        unsafe {
            on_player_connect(1);
            on_player_connect(2);
            on_player_spawn(1);
            on_player_connect(3);
            on_player_spawn(2);
        }
        let order: Vec<String> = lua
            .globals()
            .get::<mlua::Table>("order")
            .expect("order")
            .sequence_values()
            .collect::<mlua::Result<_>>()
            .expect("values");
        assert_eq!(order, ["connect1", "connect2", "spawn1", "connect3", "spawn2"]);
    }

    #[test]
    fn frame_tick_runs_deferred_callables() {
        let (lua, _host, _guard) = start_bridge(
            "ticked = 0\n\
             function on_server_frame(dt) server.defer(function() ticked = ticked + 1 end) end",
        );
        // The drain runs after the frame handler, in the same tick.
        unsafe { on_server_frame(0.016) };
        assert_eq!(lua.globals().get::<i32>("ticked").expect("ticked"), 1);
    }

    #[test]
    fn cross_thread_shutdown_signal_halts_on_the_next_frame() {
        let (_lua, host, _guard) = start_bridge("");
        let sender = signal_sender().expect("sender");
        let worker = std::thread::spawn(move || sender.shutdown());
        assert!(worker.join().expect("join"));
        unsafe { on_server_frame(0.016) };
        assert_eq!(host.shutdowns.get(), 1);
        assert!(with(|b| b.halted).expect("bridge"));
    }

    #[test]
    fn initialise_fault_reports_load_failure() {
        let (_lua, host, _guard) =
            start_bridge("function on_server_initialise() error('bad config') end");
        assert_eq!(unsafe { on_server_initialise() }, 0);
        assert!(host.logs.borrow()[0].contains("bad config"));
    }

    #[test]
    fn initialise_without_handler_succeeds() {
        let (_lua, _host, _guard) = start_bridge("");
        assert_eq!(unsafe { on_server_initialise() }, 1);
    }

    #[test]
    fn shutdown_tears_down_even_after_a_handler_fault() {
        let (_lua, host, _guard) =
            start_bridge("function on_server_shutdown() error('dying loudly') end");
        unsafe { on_server_shutdown() };
        assert!(!is_installed());
        assert!(host.logs.borrow()[0].contains("dying loudly"));
        // Events after teardown are inert.
        unsafe { on_player_connect(1) };
        assert_eq!(unsafe { on_player_request_spawn(1) }, 1);
    }

    #[test]
    fn performance_report_reaches_script_in_order() {
        let (lua, _host, _guard) = start_bridge(
            "function on_server_performance_report(report)\n\
               first_label = report[1].label\n\
               first_duration = report[1].duration\n\
               total = #report\n\
             end",
        );
        let labels = [
            CString::new("physics").expect("cstr"),
            CString::new("network").expect("cstr"),
        ];
        let mut descriptions: Vec<*const c_char> = labels.iter().map(|l| l.as_ptr()).collect();
        let mut times = [1200u64, 300u64];
        unsafe {
            on_server_performance_report(2, descriptions.as_mut_ptr(), times.as_mut_ptr())
        };
        assert_eq!(
            lua.globals().get::<String>("first_label").expect("label"),
            "physics"
        );
        assert_eq!(
            lua.globals().get::<u64>("first_duration").expect("duration"),
            1200
        );
        assert_eq!(lua.globals().get::<i64>("total").expect("total"), 2);
    }

    #[test]
    fn registration_binds_every_slot() {
        let mut callbacks = PluginCallbacks::default();
        register_callbacks(&mut callbacks);
        assert!(callbacks.unbound_slots().is_empty());
    }

    #[test]
    fn callback_table_mirrors_the_event_signatures() {
        // Slot order and names must stay in lockstep with the signature
        // table, which also supplies every gate default.
        let expected: Vec<String> = events::EVENTS
            .iter()
            .map(|e| events::handler_name(e.name))
            .collect();
        assert_eq!(PluginCallbacks::slot_names(), expected);
    }

    #[test]
    fn script_data_payloads_pass_through_as_raw_bytes() {
        let (lua, _host, _guard) = start_bridge(
            "function on_client_script_data(id, data) seen_len = #data; seen = data end",
        );
        // Not valid UTF-8 and not valid GBK; a text conversion would mangle
        // or empty it.
        let payload = [0x00u8, 0xFF, 0xC4, 0x80];
        unsafe { on_client_script_data(9, payload.as_ptr(), payload.len()) };
        assert_eq!(lua.globals().get::<i64>("seen_len").expect("len"), 4);
        let seen: mlua::String = lua.globals().get("seen").expect("seen");
        assert_eq!(&*seen.as_bytes(), payload.as_slice());
    }

    #[test]
    fn null_script_data_marshals_as_an_empty_payload() {
        let (lua, _host, _guard) =
            start_bridge("function on_client_script_data(id, data) seen_len = #data end");
        unsafe { on_client_script_data(9, std::ptr::null(), 0) };
        assert_eq!(lua.globals().get::<i64>("seen_len").expect("len"), 0);
    }

    #[test]
    fn double_install_is_rejected() {
        let host = MockHost::new();
        let lua = Lua::new();
        assert!(install(Bridge::new(lua.clone(), host.clone())));
        let _guard = Installed;
        assert!(!install(Bridge::new(lua.clone(), host)));
    }
}
