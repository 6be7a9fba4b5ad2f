use std::ffi::CString;
use std::os::raw::c_char;

use crate::encoding;

/// Plugin API version implemented by this module.
pub const API_MAJOR: u16 = 2;
pub const API_MINOR: u16 = 0;

#[repr(C)]
pub struct PluginInfo {
    pub struct_size: u32,
    pub plugin_id: u32,
    pub name: [c_char; 32],
    pub plugin_version: u32,
    pub api_major_version: u16,
    pub api_minor_version: u16,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            struct_size: std::mem::size_of::<PluginInfo>() as u32,
            plugin_id: 0,
            name: [0; 32],
            plugin_version: 0,
            api_major_version: 0,
            api_minor_version: 0,
        }
    }
}

impl PluginInfo {
    pub fn fill(&mut self, name: &str, version: u32) {
        self.plugin_version = version;
        self.api_major_version = API_MAJOR;
        self.api_minor_version = API_MINOR;
        let bytes = name.as_bytes();
        let len = bytes.len().min(self.name.len() - 1);
        for (dst, src) in self.name.iter_mut().zip(bytes.iter().take(len)) {
            *dst = *src as c_char;
        }
        self.name[len] = 0;
    }
}

#[repr(C)]
pub struct ServerSettings {
    pub struct_size: u32,
    pub server_name: [c_char; 128],
    pub max_players: u32,
    pub port: u32,
    pub flags: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            struct_size: std::mem::size_of::<ServerSettings>() as u32,
            server_name: [0; 128],
            max_players: 0,
            port: 0,
            flags: 0,
        }
    }
}

/// Error codes returned by the native function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcmpError {
    None,
    NoSuchEntity,
    BufferTooSmall,
    TooLargeInput,
    ArgumentOutOfBounds,
    NullArgument,
    PoolExhausted,
    InvalidName,
    RequestDenied,
    Unknown(i32),
}

impl VcmpError {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => VcmpError::None,
            1 => VcmpError::NoSuchEntity,
            2 => VcmpError::BufferTooSmall,
            3 => VcmpError::TooLargeInput,
            4 => VcmpError::ArgumentOutOfBounds,
            5 => VcmpError::NullArgument,
            6 => VcmpError::PoolExhausted,
            7 => VcmpError::InvalidName,
            8 => VcmpError::RequestDenied,
            other => VcmpError::Unknown(other),
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            VcmpError::None => "no error",
            VcmpError::NoSuchEntity => "no such entity",
            VcmpError::BufferTooSmall => "buffer too small",
            VcmpError::TooLargeInput => "too large input",
            VcmpError::ArgumentOutOfBounds => "argument out of bounds",
            VcmpError::NullArgument => "null argument",
            VcmpError::PoolExhausted => "pool exhausted",
            VcmpError::InvalidName => "invalid name",
            VcmpError::RequestDenied => "request denied",
            VcmpError::Unknown(_) => "unknown error",
        }
    }
}

/// Outbound function table supplied by the host at load time. Only the slots
/// this plugin calls are declared; the host fills the table, we read it.
/// Slots are `Option` so tests can build a zeroed table.
#[repr(C)]
#[derive(Default)]
pub struct PluginFuncs {
    pub struct_size: u32,

    pub get_server_version: Option<unsafe extern "C" fn() -> u32>,
    pub get_server_settings: Option<unsafe extern "C" fn(settings: *mut ServerSettings) -> i32>,
    pub log_message: Option<unsafe extern "C" fn(format: *const c_char, ...) -> u32>,
    pub get_last_error: Option<unsafe extern "C" fn() -> i32>,
    pub shutdown_server: Option<unsafe extern "C" fn()>,

    pub get_server_name: Option<unsafe extern "C" fn(buffer: *mut c_char, size: usize) -> i32>,
    pub set_server_name: Option<unsafe extern "C" fn(text: *const c_char) -> i32>,
    pub get_server_password: Option<unsafe extern "C" fn(buffer: *mut c_char, size: usize) -> i32>,
    pub set_server_password: Option<unsafe extern "C" fn(password: *const c_char) -> i32>,
    pub get_game_mode_text: Option<unsafe extern "C" fn(buffer: *mut c_char, size: usize) -> i32>,
    pub set_game_mode_text: Option<unsafe extern "C" fn(text: *const c_char) -> i32>,

    pub send_client_script_data:
        Option<unsafe extern "C" fn(player_id: i32, data: *const u8, size: usize) -> i32>,
    pub send_client_message:
        Option<unsafe extern "C" fn(player_id: i32, colour: u32, format: *const c_char, ...) -> i32>,
    pub send_game_message:
        Option<unsafe extern "C" fn(player_id: i32, kind: i32, format: *const c_char, ...) -> i32>,

    pub kick_player: Option<unsafe extern "C" fn(player_id: i32) -> i32>,
    pub ban_player: Option<unsafe extern "C" fn(player_id: i32) -> i32>,

    pub is_player_connected: Option<unsafe extern "C" fn(player_id: i32) -> u8>,
    pub get_player_name:
        Option<unsafe extern "C" fn(player_id: i32, buffer: *mut c_char, size: usize) -> i32>,
    pub set_player_name: Option<unsafe extern "C" fn(player_id: i32, name: *const c_char) -> i32>,
    pub get_player_position: Option<
        unsafe extern "C" fn(player_id: i32, x: *mut f32, y: *mut f32, z: *mut f32) -> i32,
    >,
    pub set_player_position:
        Option<unsafe extern "C" fn(player_id: i32, x: f32, y: f32, z: f32) -> i32>,
    pub get_player_health: Option<unsafe extern "C" fn(player_id: i32) -> f32>,
    pub set_player_health: Option<unsafe extern "C" fn(player_id: i32, health: f32) -> i32>,
    pub get_player_armour: Option<unsafe extern "C" fn(player_id: i32) -> f32>,
    pub set_player_armour: Option<unsafe extern "C" fn(player_id: i32, armour: f32) -> i32>,
    pub get_player_money: Option<unsafe extern "C" fn(player_id: i32) -> i32>,
    pub set_player_money: Option<unsafe extern "C" fn(player_id: i32, amount: i32) -> i32>,

    pub get_weather: Option<unsafe extern "C" fn() -> i32>,
    pub set_weather: Option<unsafe extern "C" fn(weather: i32)>,
    pub get_gravity: Option<unsafe extern "C" fn() -> f32>,
    pub set_gravity: Option<unsafe extern "C" fn(gravity: f32)>,
    pub get_time_rate: Option<unsafe extern "C" fn() -> i32>,
    pub set_time_rate: Option<unsafe extern "C" fn(rate: i32)>,
    pub get_hour: Option<unsafe extern "C" fn() -> i32>,
    pub set_hour: Option<unsafe extern "C" fn(hour: i32)>,
    pub get_minute: Option<unsafe extern "C" fn() -> i32>,
    pub set_minute: Option<unsafe extern "C" fn(minute: i32)>,
    pub set_world_bounds:
        Option<unsafe extern "C" fn(max_x: f32, min_x: f32, max_y: f32, min_y: f32)>,
    pub get_world_bounds: Option<
        unsafe extern "C" fn(max_x: *mut f32, min_x: *mut f32, max_y: *mut f32, min_y: *mut f32),
    >,

    pub play_sound:
        Option<unsafe extern "C" fn(world_id: i32, sound_id: i32, x: f32, y: f32, z: f32) -> i32>,
    pub create_explosion: Option<
        unsafe extern "C" fn(
            world_id: i32,
            kind: i32,
            x: f32,
            y: f32,
            z: f32,
            responsible_player_id: i32,
            at_ground_level: u8,
        ) -> i32,
    >,

    pub create_vehicle: Option<
        unsafe extern "C" fn(
            model_index: i32,
            world: i32,
            x: f32,
            y: f32,
            z: f32,
            angle: f32,
            primary_colour: i32,
            secondary_colour: i32,
        ) -> i32,
    >,
    pub delete_vehicle: Option<unsafe extern "C" fn(vehicle_id: i32) -> i32>,
    pub get_vehicle_position: Option<
        unsafe extern "C" fn(vehicle_id: i32, x: *mut f32, y: *mut f32, z: *mut f32) -> i32,
    >,
    pub set_vehicle_position: Option<
        unsafe extern "C" fn(vehicle_id: i32, x: f32, y: f32, z: f32, remove_occupants: u8) -> i32,
    >,

    pub create_pickup: Option<
        unsafe extern "C" fn(
            model_index: i32,
            world: i32,
            quantity: i32,
            x: f32,
            y: f32,
            z: f32,
            alpha: i32,
            is_automatic: u8,
        ) -> i32,
    >,
    pub delete_pickup: Option<unsafe extern "C" fn(pickup_id: i32) -> i32>,
}

/// The single process-wide reference to the native function table. Created
/// once at plugin load, copied freely afterwards; the table itself belongs to
/// the host and outlives the plugin.
#[derive(Clone, Copy)]
pub struct ServerHandle {
    funcs: &'static PluginFuncs,
}

impl ServerHandle {
    /// # Safety
    /// `ptr` must point to a live function table that stays valid for the
    /// rest of the process, which is what the host guarantees at load time.
    pub unsafe fn from_raw(ptr: *const PluginFuncs) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        Some(Self { funcs: &*ptr })
    }

    pub(crate) fn funcs(&self) -> &'static PluginFuncs {
        self.funcs
    }

    pub fn log_message(&self, line: &str) {
        let Some(log) = self.funcs.log_message else {
            return;
        };
        let bytes = encoding::to_native(line);
        let Ok(text) = CString::new(bytes) else {
            return;
        };
        unsafe {
            log(b"%s\0".as_ptr() as *const c_char, text.as_ptr());
        }
    }

    pub fn shutdown(&self) {
        if let Some(shutdown) = self.funcs.shutdown_server {
            unsafe { shutdown() };
        }
    }

    pub fn server_version(&self) -> u32 {
        match self.funcs.get_server_version {
            Some(f) => unsafe { f() },
            None => 0,
        }
    }

    pub fn last_error(&self) -> VcmpError {
        match self.funcs.get_last_error {
            Some(f) => VcmpError::from_raw(unsafe { f() }),
            None => VcmpError::None,
        }
    }

    /// Calls a native string getter, retrying with a larger buffer while the
    /// host reports `BufferTooSmall`, and converts the result from the native
    /// byte encoding.
    pub fn read_string(
        &self,
        context: &str,
        f: impl Fn(*mut c_char, usize) -> i32,
    ) -> Result<String, String> {
        let mut capacity = 256usize;
        loop {
            let mut buffer = vec![0u8; capacity];
            let code = f(buffer.as_mut_ptr() as *mut c_char, buffer.len());
            match VcmpError::from_raw(code) {
                VcmpError::None => {
                    let len = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
                    return Ok(encoding::to_utf8(&buffer[..len]));
                }
                VcmpError::BufferTooSmall if capacity < 4096 => capacity *= 2,
                err => return Err(format!("{context}: {}", err.message())),
            }
        }
    }
}

/// The narrow host seam the dispatch path depends on; lets the fault handling
/// run against a recording double in tests.
pub trait HostControl {
    fn log(&self, line: &str);
    fn request_shutdown(&self);
}

impl HostControl for ServerHandle {
    fn log(&self, line: &str) {
        self.log_message(line);
    }

    fn request_shutdown(&self) {
        self.shutdown();
    }
}

macro_rules! callback_slots {
    ($($field:ident: $ty:ty,)*) => {
        /// Inbound callback table. The dispatch layer fills every slot
        /// exactly once during registration.
        #[repr(C)]
        #[derive(Default)]
        pub struct PluginCallbacks {
            pub struct_size: u32,
            $(pub $field: Option<$ty>,)*
        }

        impl PluginCallbacks {
            /// Names of slots still unbound; empty after registration.
            pub fn unbound_slots(&self) -> Vec<&'static str> {
                let mut missing = Vec::new();
                $(
                    if self.$field.is_none() {
                        missing.push(stringify!($field));
                    }
                )*
                missing
            }

            /// All slot names in table order.
            pub fn slot_names() -> Vec<&'static str> {
                vec![$(stringify!($field),)*]
            }
        }
    };
}

callback_slots! {
    on_server_initialise: unsafe extern "C" fn() -> u8,
    on_server_shutdown: unsafe extern "C" fn(),
    on_server_frame: unsafe extern "C" fn(elapsed_time: f32),
    on_plugin_command: unsafe extern "C" fn(command_identifier: u32, message: *const c_char) -> u8,
    on_incoming_connection: unsafe extern "C" fn(
        player_name: *mut c_char,
        name_buffer_size: usize,
        user_password: *const c_char,
        ip_address: *const c_char,
    ) -> u8,
    on_client_script_data: unsafe extern "C" fn(player_id: i32, data: *const u8, size: usize),
    on_player_connect: unsafe extern "C" fn(player_id: i32),
    on_player_disconnect: unsafe extern "C" fn(player_id: i32, reason: i32),
    on_player_request_class: unsafe extern "C" fn(player_id: i32, offset: i32) -> u8,
    on_player_request_spawn: unsafe extern "C" fn(player_id: i32) -> u8,
    on_player_spawn: unsafe extern "C" fn(player_id: i32),
    on_player_death:
        unsafe extern "C" fn(player_id: i32, killer_id: i32, reason: i32, body_part: i32),
    on_player_update: unsafe extern "C" fn(player_id: i32, update_type: i32),
    on_player_request_enter_vehicle:
        unsafe extern "C" fn(player_id: i32, vehicle_id: i32, slot_index: i32) -> u8,
    on_player_enter_vehicle:
        unsafe extern "C" fn(player_id: i32, vehicle_id: i32, slot_index: i32),
    on_player_exit_vehicle: unsafe extern "C" fn(player_id: i32, vehicle_id: i32),
    on_player_name_change:
        unsafe extern "C" fn(player_id: i32, old_name: *const c_char, new_name: *const c_char),
    on_player_state_change: unsafe extern "C" fn(player_id: i32, old_state: i32, new_state: i32),
    on_player_action_change:
        unsafe extern "C" fn(player_id: i32, old_action: i32, new_action: i32),
    on_player_on_fire_change: unsafe extern "C" fn(player_id: i32, is_on_fire: u8),
    on_player_crouch_change: unsafe extern "C" fn(player_id: i32, is_crouching: u8),
    on_player_game_keys_change: unsafe extern "C" fn(player_id: i32, old_keys: u32, new_keys: u32),
    on_player_begin_typing: unsafe extern "C" fn(player_id: i32),
    on_player_end_typing: unsafe extern "C" fn(player_id: i32),
    on_player_away_change: unsafe extern "C" fn(player_id: i32, is_away: u8),
    on_player_message: unsafe extern "C" fn(player_id: i32, message: *const c_char) -> u8,
    on_player_command: unsafe extern "C" fn(player_id: i32, message: *const c_char) -> u8,
    on_player_private_message:
        unsafe extern "C" fn(player_id: i32, target_player_id: i32, message: *const c_char) -> u8,
    on_player_key_bind_down: unsafe extern "C" fn(player_id: i32, bind_id: i32),
    on_player_key_bind_up: unsafe extern "C" fn(player_id: i32, bind_id: i32),
    on_player_spectate: unsafe extern "C" fn(player_id: i32, target_player_id: i32),
    on_player_crash_report: unsafe extern "C" fn(player_id: i32, report: *const c_char),
    on_vehicle_update: unsafe extern "C" fn(vehicle_id: i32, update_type: i32),
    on_vehicle_explode: unsafe extern "C" fn(vehicle_id: i32),
    on_vehicle_respawn: unsafe extern "C" fn(vehicle_id: i32),
    on_object_shot: unsafe extern "C" fn(object_id: i32, player_id: i32, weapon_id: i32),
    on_object_touched: unsafe extern "C" fn(object_id: i32, player_id: i32),
    on_pickup_pick_attempt: unsafe extern "C" fn(pickup_id: i32, player_id: i32) -> u8,
    on_pickup_picked: unsafe extern "C" fn(pickup_id: i32, player_id: i32),
    on_pickup_respawn: unsafe extern "C" fn(pickup_id: i32),
    on_checkpoint_entered: unsafe extern "C" fn(checkpoint_id: i32, player_id: i32),
    on_checkpoint_exited: unsafe extern "C" fn(checkpoint_id: i32, player_id: i32),
    on_entity_pool_change: unsafe extern "C" fn(entity_type: i32, entity_id: i32, is_deleted: u8),
    on_server_performance_report: unsafe extern "C" fn(
        entry_count: usize,
        descriptions: *mut *const c_char,
        times: *mut u64,
    ),
    on_player_module_list: unsafe extern "C" fn(player_id: i32, list: *const c_char),
}
