//! Static description of every native event the host can emit. The dispatch
//! layer and tests both key off this table; handler names derive from it.

pub const DEFAULT_ALLOW: u8 = 1;
pub const DEFAULT_DENY: u8 = 0;

pub const HANDLER_PREFIX: &str = "on_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// Handler result is discarded.
    Unit,
    /// Handler may return a boolean; anything else falls back to `default`.
    Gate { default: u8 },
    /// Gate that additionally accepts a string to rewrite the name buffer.
    NameGate { default: u8 },
}

#[derive(Debug, Clone, Copy)]
pub struct EventSignature {
    pub name: &'static str,
    pub returns: ReturnKind,
}

const fn unit(name: &'static str) -> EventSignature {
    EventSignature {
        name,
        returns: ReturnKind::Unit,
    }
}

const fn gate(name: &'static str) -> EventSignature {
    EventSignature {
        name,
        returns: ReturnKind::Gate {
            default: DEFAULT_ALLOW,
        },
    }
}

/// All 45 native events, in the order the host's callback table declares
/// them. Scripts handle an event by defining a global `on_<name>`.
pub const EVENTS: &[EventSignature] = &[
    gate("server_initialise"),
    unit("server_shutdown"),
    unit("server_frame"),
    gate("plugin_command"),
    EventSignature {
        name: "incoming_connection",
        returns: ReturnKind::NameGate {
            default: DEFAULT_ALLOW,
        },
    },
    unit("client_script_data"),
    unit("player_connect"),
    unit("player_disconnect"),
    gate("player_request_class"),
    gate("player_request_spawn"),
    unit("player_spawn"),
    unit("player_death"),
    unit("player_update"),
    gate("player_request_enter_vehicle"),
    unit("player_enter_vehicle"),
    unit("player_exit_vehicle"),
    unit("player_name_change"),
    unit("player_state_change"),
    unit("player_action_change"),
    unit("player_on_fire_change"),
    unit("player_crouch_change"),
    unit("player_game_keys_change"),
    unit("player_begin_typing"),
    unit("player_end_typing"),
    unit("player_away_change"),
    gate("player_message"),
    gate("player_command"),
    gate("player_private_message"),
    unit("player_key_bind_down"),
    unit("player_key_bind_up"),
    unit("player_spectate"),
    unit("player_crash_report"),
    unit("vehicle_update"),
    unit("vehicle_explode"),
    unit("vehicle_respawn"),
    unit("object_shot"),
    unit("object_touched"),
    gate("pickup_pick_attempt"),
    unit("pickup_picked"),
    unit("pickup_respawn"),
    unit("checkpoint_entered"),
    unit("checkpoint_exited"),
    unit("entity_pool_change"),
    unit("server_performance_report"),
    unit("player_module_list"),
];

pub fn handler_name(event: &str) -> String {
    format!("{HANDLER_PREFIX}{event}")
}

pub fn signature(event: &str) -> Option<&'static EventSignature> {
    EVENTS.iter().find(|e| e.name == event)
}

/// The native return used when a handler gives no usable decision. Unit
/// events have no return value; allow keeps an accidental lookup harmless.
pub fn default_return(event: &str) -> u8 {
    match signature(event).map(|e| e.returns) {
        Some(ReturnKind::Gate { default }) | Some(ReturnKind::NameGate { default }) => default,
        _ => DEFAULT_ALLOW,
    }
}
