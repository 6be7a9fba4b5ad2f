//! Classification of script faults. Every error escaping a handler is sorted
//! into one of three classes; only the interrupt class escalates to a host
//! shutdown, everything else is absorbed so the server keeps running.

use thiserror::Error;

/// Raised from script space (via `server.exit()`) to request an orderly
/// server shutdown. The one fault class that is never absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("shutdown requested from script")]
pub struct InterruptRequested;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Deliberate stop request; escalates to exactly one host shutdown call.
    Interrupt,
    /// Ordinary script error, logged and absorbed.
    Script(String),
    /// Interpreter-internal failure (allocation and the like).
    Unknown(String),
}

pub fn classify(err: &mlua::Error) -> FaultKind {
    match err {
        mlua::Error::CallbackError { cause, .. } => classify(cause),
        mlua::Error::WithContext { cause, .. } => classify(cause),
        mlua::Error::ExternalError(inner) => {
            if inner.downcast_ref::<InterruptRequested>().is_some() {
                FaultKind::Interrupt
            } else {
                FaultKind::Script(err.to_string())
            }
        }
        mlua::Error::MemoryError(msg) => FaultKind::Unknown(msg.clone()),
        other => FaultKind::Script(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_marker_classifies_as_interrupt() {
        let err = mlua::Error::external(InterruptRequested);
        assert_eq!(classify(&err), FaultKind::Interrupt);
    }

    #[test]
    fn interrupt_survives_callback_wrapping() {
        let err = mlua::Error::CallbackError {
            traceback: String::new(),
            cause: std::sync::Arc::new(mlua::Error::external(InterruptRequested)),
        };
        assert_eq!(classify(&err), FaultKind::Interrupt);
    }

    #[test]
    fn runtime_errors_classify_as_script_faults() {
        let err = mlua::Error::RuntimeError("attempt to index a nil value".into());
        match classify(&err) {
            FaultKind::Script(msg) => assert!(msg.contains("nil value")),
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn other_external_errors_stay_script_faults() {
        let err = mlua::Error::external(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert!(matches!(classify(&err), FaultKind::Script(_)));
    }

    #[test]
    fn memory_errors_classify_as_unknown() {
        let err = mlua::Error::MemoryError("out of memory".into());
        assert_eq!(classify(&err), FaultKind::Unknown("out of memory".into()));
    }

    #[test]
    fn faults_raised_through_lua_keep_their_class() {
        let lua = mlua::Lua::new();
        let exit = lua
            .create_function(|_, ()| -> mlua::Result<()> {
                Err(mlua::Error::external(InterruptRequested))
            })
            .expect("create function");
        lua.globals().set("exit", exit).expect("set global");
        let err = lua
            .load("exit()")
            .exec()
            .expect_err("exit raises");
        assert_eq!(classify(&err), FaultKind::Interrupt);
    }
}
