//! The `server` table installed into Lua globals: thin pass-through wrappers
//! over the host function table plus the few plugin-level primitives
//! (`exit`, `defer`, debug toggle). Native error codes surface as Lua errors
//! carrying the described message; missing host slots do the same.

use std::ffi::CString;
use std::os::raw::c_char;
use std::rc::Rc;

use mlua::{Function, Lua, LuaSerdeExt, Table};
use serde::Serialize;

use crate::dispatch::{ControlSignal, SignalSender};
use crate::encoding;
use crate::fault::InterruptRequested;
use crate::ffi::{HostControl, ServerHandle, ServerSettings, VcmpError};
use crate::runtime;

fn check(code: i32, context: &str) -> mlua::Result<()> {
    match VcmpError::from_raw(code) {
        VcmpError::None => Ok(()),
        err => Err(mlua::Error::RuntimeError(format!(
            "{context}: {}",
            err.message()
        ))),
    }
}

fn native_text(text: &str) -> mlua::Result<CString> {
    CString::new(encoding::to_native(text))
        .map_err(|_| mlua::Error::RuntimeError("text contains an embedded NUL".into()))
}

fn vector(lua: &Lua, x: f32, y: f32, z: f32) -> mlua::Result<Table> {
    let v = lua.create_table_with_capacity(0, 3)?;
    v.set("x", x)?;
    v.set("y", y)?;
    v.set("z", z)?;
    Ok(v)
}

macro_rules! native {
    ($funcs:expr, $slot:ident) => {
        $funcs.$slot.ok_or_else(|| {
            mlua::Error::RuntimeError(format!("host does not provide {}", stringify!($slot)))
        })?
    };
}

/// Builds the `server` global. `server` is `None` only in tests; the plugin
/// primitives work either way, the native wrappers need the host table.
pub fn install(
    lua: &Lua,
    host: Rc<dyn HostControl>,
    server: Option<ServerHandle>,
    signals: SignalSender,
) -> mlua::Result<()> {
    let table = lua.create_table()?;

    {
        let host = host.clone();
        table.set(
            "log",
            lua.create_function(move |_, message: String| {
                host.log(&message);
                Ok(())
            })?,
        )?;
    }

    table.set(
        "exit",
        lua.create_function(|_, ()| -> mlua::Result<()> {
            Err(mlua::Error::external(InterruptRequested))
        })?,
    )?;

    table.set(
        "defer",
        lua.create_function(move |lua, callable: Function| {
            let key = lua.create_registry_value(callable)?;
            signals.send(ControlSignal::Invoke(key));
            Ok(())
        })?,
    )?;

    table.set(
        "plugin_name",
        lua.create_function(|_, ()| Ok(crate::PLUGIN_NAME))?,
    )?;
    table.set(
        "plugin_version",
        lua.create_function(|_, ()| Ok(crate::PLUGIN_VERSION))?,
    )?;
    table.set(
        "set_debug",
        lua.create_function(|_, enabled: bool| {
            runtime::set_debug(enabled);
            Ok(())
        })?,
    )?;
    table.set(
        "get_debug",
        lua.create_function(|_, ()| Ok(runtime::debug_enabled()))?,
    )?;

    // JSON helpers, mostly for client script data payloads.
    table.set(
        "json_encode",
        lua.create_function(|lua, value: mlua::Value| {
            let json: serde_json::Value = lua.from_value(value)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?,
    )?;
    table.set(
        "json_decode",
        lua.create_function(|lua, text: String| {
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(mlua::Error::external)?;
            lua.to_value(&json)
        })?,
    )?;

    if let Some(server) = server {
        install_native(lua, &table, server)?;
    }

    lua.globals().set("server", table)
}

#[derive(Serialize)]
struct SettingsView {
    server_name: String,
    max_players: u32,
    port: u32,
    flags: u32,
}

fn install_native(lua: &Lua, table: &Table, server: ServerHandle) -> mlua::Result<()> {
    let funcs = server.funcs();

    table.set(
        "shutdown",
        lua.create_function(move |_, ()| {
            server.shutdown();
            Ok(())
        })?,
    )?;
    table.set(
        "version",
        lua.create_function(move |_, ()| Ok(server.server_version()))?,
    )?;
    table.set(
        "last_error",
        lua.create_function(move |_, ()| Ok(server.last_error().message()))?,
    )?;
    table.set(
        "settings",
        lua.create_function(move |lua, ()| {
            let get = native!(funcs, get_server_settings);
            let mut settings = ServerSettings::default();
            check(unsafe { get(&mut settings) }, "settings")?;
            let name_bytes: Vec<u8> = settings
                .server_name
                .iter()
                .take_while(|c| **c != 0)
                .map(|c| *c as u8)
                .collect();
            lua.to_value(&SettingsView {
                server_name: encoding::to_utf8(&name_bytes),
                max_players: settings.max_players,
                port: settings.port,
                flags: settings.flags,
            })
        })?,
    )?;

    table.set(
        "get_server_name",
        lua.create_function(move |_, ()| {
            let get = native!(funcs, get_server_name);
            server
                .read_string("server name", |buffer, size| unsafe { get(buffer, size) })
                .map_err(mlua::Error::RuntimeError)
        })?,
    )?;
    table.set(
        "set_server_name",
        lua.create_function(move |_, name: String| {
            let set = native!(funcs, set_server_name);
            let name = native_text(&name)?;
            check(unsafe { set(name.as_ptr()) }, "set server name")
        })?,
    )?;
    table.set(
        "get_server_password",
        lua.create_function(move |_, ()| {
            let get = native!(funcs, get_server_password);
            server
                .read_string("server password", |buffer, size| unsafe {
                    get(buffer, size)
                })
                .map_err(mlua::Error::RuntimeError)
        })?,
    )?;
    table.set(
        "set_server_password",
        lua.create_function(move |_, password: String| {
            let set = native!(funcs, set_server_password);
            let password = native_text(&password)?;
            check(unsafe { set(password.as_ptr()) }, "set server password")
        })?,
    )?;
    table.set(
        "get_game_mode",
        lua.create_function(move |_, ()| {
            let get = native!(funcs, get_game_mode_text);
            server
                .read_string("game mode", |buffer, size| unsafe { get(buffer, size) })
                .map_err(mlua::Error::RuntimeError)
        })?,
    )?;
    table.set(
        "set_game_mode",
        lua.create_function(move |_, text: String| {
            let set = native!(funcs, set_game_mode_text);
            let text = native_text(&text)?;
            check(unsafe { set(text.as_ptr()) }, "set game mode")
        })?,
    )?;

    table.set(
        "send_client_message",
        lua.create_function(move |_, (player_id, colour, text): (i32, u32, String)| {
            let send = native!(funcs, send_client_message);
            let text = native_text(&text)?;
            let code = unsafe {
                send(
                    player_id,
                    colour,
                    b"%s\0".as_ptr() as *const c_char,
                    text.as_ptr(),
                )
            };
            check(code, "send client message")
        })?,
    )?;
    table.set(
        "send_game_message",
        lua.create_function(move |_, (player_id, kind, text): (i32, i32, String)| {
            let send = native!(funcs, send_game_message);
            let text = native_text(&text)?;
            let code = unsafe {
                send(
                    player_id,
                    kind,
                    b"%s\0".as_ptr() as *const c_char,
                    text.as_ptr(),
                )
            };
            check(code, "send game message")
        })?,
    )?;
    table.set(
        "send_client_script_data",
        lua.create_function(move |_, (player_id, data): (i32, mlua::String)| {
            let send = native!(funcs, send_client_script_data);
            let bytes = data.as_bytes();
            let code = unsafe { send(player_id, bytes.as_ptr(), bytes.len()) };
            check(code, "send client script data")
        })?,
    )?;

    table.set(
        "kick_player",
        lua.create_function(move |_, player_id: i32| {
            let kick = native!(funcs, kick_player);
            check(unsafe { kick(player_id) }, "kick player")
        })?,
    )?;
    table.set(
        "ban_player",
        lua.create_function(move |_, player_id: i32| {
            let ban = native!(funcs, ban_player);
            check(unsafe { ban(player_id) }, "ban player")
        })?,
    )?;
    table.set(
        "is_player_connected",
        lua.create_function(move |_, player_id: i32| {
            let connected = native!(funcs, is_player_connected);
            Ok(unsafe { connected(player_id) } != 0)
        })?,
    )?;
    table.set(
        "get_player_name",
        lua.create_function(move |_, player_id: i32| {
            let get = native!(funcs, get_player_name);
            server
                .read_string("player name", |buffer, size| unsafe {
                    get(player_id, buffer, size)
                })
                .map_err(mlua::Error::RuntimeError)
        })?,
    )?;
    table.set(
        "set_player_name",
        lua.create_function(move |_, (player_id, name): (i32, String)| {
            let set = native!(funcs, set_player_name);
            let name = native_text(&name)?;
            check(unsafe { set(player_id, name.as_ptr()) }, "set player name")
        })?,
    )?;
    table.set(
        "get_player_position",
        lua.create_function(move |lua, player_id: i32| {
            let get = native!(funcs, get_player_position);
            let (mut x, mut y, mut z) = (0f32, 0f32, 0f32);
            check(
                unsafe { get(player_id, &mut x, &mut y, &mut z) },
                "player position",
            )?;
            vector(lua, x, y, z)
        })?,
    )?;
    table.set(
        "set_player_position",
        lua.create_function(move |_, (player_id, x, y, z): (i32, f32, f32, f32)| {
            let set = native!(funcs, set_player_position);
            check(unsafe { set(player_id, x, y, z) }, "set player position")
        })?,
    )?;
    table.set(
        "get_player_health",
        lua.create_function(move |_, player_id: i32| {
            let get = native!(funcs, get_player_health);
            Ok(unsafe { get(player_id) })
        })?,
    )?;
    table.set(
        "set_player_health",
        lua.create_function(move |_, (player_id, health): (i32, f32)| {
            let set = native!(funcs, set_player_health);
            check(unsafe { set(player_id, health) }, "set player health")
        })?,
    )?;
    table.set(
        "get_player_armour",
        lua.create_function(move |_, player_id: i32| {
            let get = native!(funcs, get_player_armour);
            Ok(unsafe { get(player_id) })
        })?,
    )?;
    table.set(
        "set_player_armour",
        lua.create_function(move |_, (player_id, armour): (i32, f32)| {
            let set = native!(funcs, set_player_armour);
            check(unsafe { set(player_id, armour) }, "set player armour")
        })?,
    )?;
    table.set(
        "get_player_money",
        lua.create_function(move |_, player_id: i32| {
            let get = native!(funcs, get_player_money);
            Ok(unsafe { get(player_id) })
        })?,
    )?;
    table.set(
        "set_player_money",
        lua.create_function(move |_, (player_id, amount): (i32, i32)| {
            let set = native!(funcs, set_player_money);
            check(unsafe { set(player_id, amount) }, "set player money")
        })?,
    )?;

    table.set(
        "get_weather",
        lua.create_function(move |_, ()| {
            let get = native!(funcs, get_weather);
            Ok(unsafe { get() })
        })?,
    )?;
    table.set(
        "set_weather",
        lua.create_function(move |_, weather: i32| {
            let set = native!(funcs, set_weather);
            unsafe { set(weather) };
            Ok(())
        })?,
    )?;
    table.set(
        "get_gravity",
        lua.create_function(move |_, ()| {
            let get = native!(funcs, get_gravity);
            Ok(unsafe { get() })
        })?,
    )?;
    table.set(
        "set_gravity",
        lua.create_function(move |_, gravity: f32| {
            let set = native!(funcs, set_gravity);
            unsafe { set(gravity) };
            Ok(())
        })?,
    )?;
    table.set(
        "get_time_rate",
        lua.create_function(move |_, ()| {
            let get = native!(funcs, get_time_rate);
            Ok(unsafe { get() })
        })?,
    )?;
    table.set(
        "set_time_rate",
        lua.create_function(move |_, rate: i32| {
            let set = native!(funcs, set_time_rate);
            unsafe { set(rate) };
            Ok(())
        })?,
    )?;
    table.set(
        "get_hour",
        lua.create_function(move |_, ()| {
            let get = native!(funcs, get_hour);
            Ok(unsafe { get() })
        })?,
    )?;
    table.set(
        "set_hour",
        lua.create_function(move |_, hour: i32| {
            let set = native!(funcs, set_hour);
            unsafe { set(hour) };
            Ok(())
        })?,
    )?;
    table.set(
        "get_minute",
        lua.create_function(move |_, ()| {
            let get = native!(funcs, get_minute);
            Ok(unsafe { get() })
        })?,
    )?;
    table.set(
        "set_minute",
        lua.create_function(move |_, minute: i32| {
            let set = native!(funcs, set_minute);
            unsafe { set(minute) };
            Ok(())
        })?,
    )?;
    table.set(
        "set_world_bounds",
        lua.create_function(
            move |_, (max_x, min_x, max_y, min_y): (f32, f32, f32, f32)| {
                let set = native!(funcs, set_world_bounds);
                unsafe { set(max_x, min_x, max_y, min_y) };
                Ok(())
            },
        )?,
    )?;
    table.set(
        "get_world_bounds",
        lua.create_function(move |lua, ()| {
            let get = native!(funcs, get_world_bounds);
            let (mut max_x, mut min_x, mut max_y, mut min_y) = (0f32, 0f32, 0f32, 0f32);
            unsafe { get(&mut max_x, &mut min_x, &mut max_y, &mut min_y) };
            let out = lua.create_table_with_capacity(0, 4)?;
            out.set("max_x", max_x)?;
            out.set("min_x", min_x)?;
            out.set("max_y", max_y)?;
            out.set("min_y", min_y)?;
            Ok(out)
        })?,
    )?;

    table.set(
        "play_sound",
        lua.create_function(
            move |_, (world_id, sound_id, x, y, z): (i32, i32, f32, f32, f32)| {
                let play = native!(funcs, play_sound);
                check(unsafe { play(world_id, sound_id, x, y, z) }, "play sound")
            },
        )?,
    )?;
    table.set(
        "create_explosion",
        lua.create_function(
            move |_,
                  (world_id, kind, x, y, z, responsible, at_ground): (
                i32,
                i32,
                f32,
                f32,
                f32,
                i32,
                bool,
            )| {
                let create = native!(funcs, create_explosion);
                let code =
                    unsafe { create(world_id, kind, x, y, z, responsible, at_ground as u8) };
                check(code, "create explosion")
            },
        )?,
    )?;

    table.set(
        "create_vehicle",
        lua.create_function(
            move |_,
                  (model, world, x, y, z, angle, colour1, colour2): (
                i32,
                i32,
                f32,
                f32,
                f32,
                f32,
                i32,
                i32,
            )| {
                let create = native!(funcs, create_vehicle);
                let id = unsafe { create(model, world, x, y, z, angle, colour1, colour2) };
                if id < 0 {
                    return Err(mlua::Error::RuntimeError(format!(
                        "create vehicle: {}",
                        server.last_error().message()
                    )));
                }
                Ok(id)
            },
        )?,
    )?;
    table.set(
        "delete_vehicle",
        lua.create_function(move |_, vehicle_id: i32| {
            let delete = native!(funcs, delete_vehicle);
            check(unsafe { delete(vehicle_id) }, "delete vehicle")
        })?,
    )?;
    table.set(
        "get_vehicle_position",
        lua.create_function(move |lua, vehicle_id: i32| {
            let get = native!(funcs, get_vehicle_position);
            let (mut x, mut y, mut z) = (0f32, 0f32, 0f32);
            check(
                unsafe { get(vehicle_id, &mut x, &mut y, &mut z) },
                "vehicle position",
            )?;
            vector(lua, x, y, z)
        })?,
    )?;
    table.set(
        "set_vehicle_position",
        lua.create_function(
            move |_, (vehicle_id, x, y, z, remove_occupants): (i32, f32, f32, f32, Option<bool>)| {
                let set = native!(funcs, set_vehicle_position);
                let code = unsafe {
                    set(vehicle_id, x, y, z, remove_occupants.unwrap_or(false) as u8)
                };
                check(code, "set vehicle position")
            },
        )?,
    )?;

    table.set(
        "create_pickup",
        lua.create_function(
            move |_,
                  (model, world, quantity, x, y, z, alpha, automatic): (
                i32,
                i32,
                i32,
                f32,
                f32,
                f32,
                i32,
                bool,
            )| {
                let create = native!(funcs, create_pickup);
                let id =
                    unsafe { create(model, world, quantity, x, y, z, alpha, automatic as u8) };
                if id < 0 {
                    return Err(mlua::Error::RuntimeError(format!(
                        "create pickup: {}",
                        server.last_error().message()
                    )));
                }
                Ok(id)
            },
        )?,
    )?;
    table.set(
        "delete_pickup",
        lua.create_function(move |_, pickup_id: i32| {
            let delete = native!(funcs, delete_pickup);
            check(unsafe { delete(pickup_id) }, "delete pickup")
        })?,
    )?;

    Ok(())
}
