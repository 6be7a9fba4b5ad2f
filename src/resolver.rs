//! Handler lookup with lazy no-op aliasing. The first time an event fires
//! with no `on_<event>` global defined, the shared no-op function is written
//! into the globals table under that name and a debug notice is logged once;
//! later dispatches of the event find the alias like any other handler. A
//! script that defines the real handler afterwards simply replaces the alias.

use std::collections::HashSet;

use mlua::{Function, Lua, MultiValue, Value};
use tracing::debug;

use crate::events;

pub struct HandlerResolver {
    noop: Option<Function>,
    aliased: HashSet<String>,
}

impl HandlerResolver {
    pub fn new(lua: &Lua) -> Self {
        // If creating the shared no-op fails the resolver stays usable for
        // defined handlers and declines the rest.
        let noop = match lua.create_function(|_, _: MultiValue| Ok(())) {
            Ok(f) => Some(f),
            Err(err) => {
                debug!("could not create shared no-op handler: {err}");
                None
            }
        };
        Self {
            noop,
            aliased: HashSet::new(),
        }
    }

    /// Looks up the handler for `event`, binding the shared no-op under the
    /// handler name on first miss. `None` only when no handler exists and no
    /// no-op could be bound; the caller then completes with the default.
    pub fn resolve(&mut self, lua: &Lua, event: &str) -> Option<Function> {
        let name = events::handler_name(event);
        let globals = lua.globals();
        match globals.get::<Value>(name.as_str()) {
            Ok(Value::Function(handler)) => return Some(handler),
            Ok(_) => {}
            Err(err) => {
                debug!("handler lookup for {name} failed: {err}");
                return None;
            }
        }
        let noop = self.noop.clone()?;
        if self.aliased.insert(name.clone()) {
            debug!("no {name} defined, binding empty handler");
        }
        if let Err(err) = globals.set(name.as_str(), noop.clone()) {
            debug!("could not bind empty handler {name}: {err}");
        }
        Some(noop)
    }

    #[cfg(test)]
    fn aliased_count(&self) -> usize {
        self.aliased.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_handler_gets_the_noop_bound_into_globals() {
        let lua = Lua::new();
        let mut resolver = HandlerResolver::new(&lua);
        let handler = resolver.resolve(&lua, "player_connect").expect("handler");
        handler.call::<()>(42).expect("noop accepts any args");
        let bound: Value = lua.globals().get("on_player_connect").expect("global");
        assert!(matches!(bound, Value::Function(_)));
    }

    #[test]
    fn second_miss_neither_rebinds_nor_renotices() {
        let lua = Lua::new();
        let mut resolver = HandlerResolver::new(&lua);
        resolver.resolve(&lua, "player_spawn").expect("first");
        assert_eq!(resolver.aliased_count(), 1);
        resolver.resolve(&lua, "player_spawn").expect("second");
        assert_eq!(resolver.aliased_count(), 1);
    }

    #[test]
    fn defined_handlers_win_over_the_alias() {
        let lua = Lua::new();
        let mut resolver = HandlerResolver::new(&lua);
        resolver.resolve(&lua, "player_command").expect("alias");
        lua.load("function on_player_command(id) replaced = id end")
            .exec()
            .expect("define handler");
        let handler = resolver.resolve(&lua, "player_command").expect("handler");
        handler.call::<()>(7).expect("call");
        assert_eq!(lua.globals().get::<i32>("replaced").expect("replaced"), 7);
    }

    #[test]
    fn non_function_globals_are_shadowed_by_the_noop() {
        let lua = Lua::new();
        lua.globals()
            .set("on_player_death", "not callable")
            .expect("set");
        let mut resolver = HandlerResolver::new(&lua);
        let handler = resolver.resolve(&lua, "player_death").expect("handler");
        handler.call::<()>(()).expect("noop");
    }
}
