//! Bridge builder and user-facing call surface.
//!
//! The [`BridgeBuilder`] provides a fluent API for describing the companion
//! process and registering the remote operations it exposes. The [`Bridge`]
//! manages the lifecycle:
//! 1. Lazily spawn the companion on the first call (or explicit `start`)
//! 2. Serialize calls over the companion's standard streams
//! 3. Tear down deterministically on `close`, and on drop as a safety net
//!
//! # Example
//!
//! ```ignore
//! use sidecall::Bridge;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = Bridge::builder("node")
//!         .entry("companion/index.js")
//!         .operation("add", "module.exports.add")
//!         .build();
//!
//!     let sum = bridge.invoke("add", &[json!(2), json!(3)]).await?;
//!     assert_eq!(sum, json!(5));
//!
//!     bridge.close().await;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{BridgeError, Result};
use crate::runner::{self, Companion, CompanionSpec};

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on how long teardown waits for the exit status after the
/// kill signal.
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// One registered remote operation: a local name bound to a function path
/// inside the companion's address space.
#[derive(Debug, Clone)]
struct Operation {
    name: String,
    path: String,
}

/// Lifecycle of a bridge. `Closed` is terminal.
enum Lifecycle {
    Unstarted,
    Running(Companion),
    Closed,
}

/// Builder for configuring and creating a [`Bridge`].
pub struct BridgeBuilder {
    program: String,
    entry: Option<PathBuf>,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    ops: Vec<Operation>,
    call_timeout: Option<Duration>,
    teardown_grace: Duration,
}

impl BridgeBuilder {
    /// Create a builder for a companion run by `program`.
    ///
    /// A bare program name is resolved on `PATH` at spawn time; a path is
    /// used as-is.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            entry: None,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            ops: Vec::new(),
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
        }
    }

    /// Entry script, passed to the program as its first argument. The
    /// companion's working directory defaults to this script's directory.
    pub fn entry(mut self, path: impl Into<PathBuf>) -> Self {
        self.entry = Some(path.into());
        self
    }

    /// Append an extra argument after the entry script.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Override the companion's working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable for the companion. Everything not set
    /// here passes through from the host.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Register a remote operation: `name` becomes invocable on the bridge
    /// and maps to `path` inside the companion. Re-registering a name
    /// replaces its path.
    pub fn operation(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        let name = name.into();
        let path = path.into();
        match self.ops.iter_mut().find(|op| op.name == name) {
            Some(existing) => existing.path = path,
            None => self.ops.push(Operation { name, path }),
        }
        self
    }

    /// Set the per-call deadline. Default: 30 seconds.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Remove the per-call deadline entirely.
    pub fn no_call_timeout(mut self) -> Self {
        self.call_timeout = None;
        self
    }

    /// Bound how long teardown waits for the exit status after the kill
    /// signal. Default: 5 seconds.
    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Build the bridge. The companion is not spawned until the first
    /// invocation or an explicit [`Bridge::start`].
    pub fn build(self) -> Bridge {
        Bridge {
            spec: CompanionSpec {
                program: self.program,
                entry: self.entry,
                args: self.args,
                cwd: self.cwd,
                env: self.env,
            },
            ops: self.ops,
            call_timeout: self.call_timeout,
            teardown_grace: self.teardown_grace,
            owner_pid: std::process::id(),
            state: Mutex::new(Lifecycle::Unstarted),
            pid: parking_lot::Mutex::new(None),
        }
    }
}

/// One logical connection to a companion process.
///
/// Calls are strictly serialized: a second `invoke` issued while one is in
/// flight queues behind it. Explicit [`close`](Bridge::close) is the
/// primary teardown; dropping the bridge runs the same kill-then-wait
/// sequence as a leak-safety net, with a fork check so a descendant
/// process can never kill the owner's companion.
pub struct Bridge {
    spec: CompanionSpec,
    ops: Vec<Operation>,
    call_timeout: Option<Duration>,
    teardown_grace: Duration,
    owner_pid: u32,
    state: Mutex<Lifecycle>,
    pid: parking_lot::Mutex<Option<u32>>,
}

impl Bridge {
    /// Create a new bridge builder.
    pub fn builder(program: impl Into<String>) -> BridgeBuilder {
        BridgeBuilder::new(program)
    }

    /// Spawn the companion now instead of on the first call.
    ///
    /// Idempotent while running. Fails with [`BridgeError::Closed`] once
    /// the bridge is closed.
    pub async fn start(&self) -> Result<()> {
        self.check_owner()?;
        let mut state = self.state.lock().await;
        self.ensure_running(&mut state)
    }

    /// Invoke a registered operation and return its result value.
    ///
    /// Spawns the companion first if this is the first call. On a timeout
    /// or a closed output stream the companion is torn down and the bridge
    /// becomes closed; a companion-reported error leaves it usable.
    pub async fn invoke(&self, operation: &str, args: &[Value]) -> Result<Value> {
        let path = self
            .ops
            .iter()
            .find(|op| op.name == operation)
            .map(|op| op.path.clone())
            .ok_or_else(|| BridgeError::UnknownOperation(operation.to_string()))?;

        self.check_owner()?;
        let mut state = self.state.lock().await;
        self.ensure_running(&mut state)?;
        let companion = match &mut *state {
            Lifecycle::Running(companion) => companion,
            _ => return Err(BridgeError::Closed),
        };

        match companion.call(&path, args, self.call_timeout).await {
            Ok(value) => Ok(value),
            Err(e @ (BridgeError::Timeout(_) | BridgeError::StreamClosed { .. })) => {
                // A wedged or dead companion is not trusted to recover.
                self.teardown(&mut state).await;
                Err(e)
            }
            Err(other) => Err(other),
        }
    }

    /// Invoke a registered operation and deserialize its result.
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        operation: &str,
        args: &[Value],
    ) -> Result<T> {
        let value = self.invoke(operation, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Names of the registered operations, in registration order.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().map(|op| op.name.as_str())
    }

    /// Current companion process id, or `None` while unstarted or after
    /// close.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    /// Close the bridge: kill the companion, collect its exit status, and
    /// pin the lifecycle at closed.
    ///
    /// Idempotent, bounded by the teardown grace period, and infallible -
    /// teardown failures are logged, never raised. In a forked descendant
    /// this only marks the local copy closed and never signals the
    /// owner's companion.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if std::process::id() != self.owner_pid {
            if let Lifecycle::Running(companion) = std::mem::replace(&mut *state, Lifecycle::Closed)
            {
                companion.disown();
            }
            *self.pid.lock() = None;
            return;
        }
        self.teardown(&mut state).await;
    }

    /// Post-fork use of a bridge by a descendant process is unsupported.
    fn check_owner(&self) -> Result<()> {
        if std::process::id() != self.owner_pid {
            return Err(BridgeError::Closed);
        }
        Ok(())
    }

    fn ensure_running(&self, state: &mut Lifecycle) -> Result<()> {
        match state {
            Lifecycle::Running(_) => Ok(()),
            Lifecycle::Closed => Err(BridgeError::Closed),
            Lifecycle::Unstarted => match runner::start(&self.spec) {
                Ok(companion) => {
                    *self.pid.lock() = Some(companion.pid());
                    *state = Lifecycle::Running(companion);
                    Ok(())
                }
                Err(e) => {
                    // A failed spawn is fatal to this instance.
                    *state = Lifecycle::Closed;
                    Err(e)
                }
            },
        }
    }

    async fn teardown(&self, state: &mut Lifecycle) {
        if let Lifecycle::Running(companion) = std::mem::replace(state, Lifecycle::Closed) {
            companion.shutdown(self.teardown_grace).await;
        }
        *self.pid.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_registers_operations_in_order() {
        let bridge = Bridge::builder("node")
            .operation("first", "a.first")
            .operation("second", "a.second")
            .operation("third", "b.third")
            .build();

        let names: Vec<&str> = bridge.operations().collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_builder_reregistration_replaces_path() {
        let bridge = Bridge::builder("node")
            .operation("op", "old.path")
            .operation("op", "new.path")
            .build();

        assert_eq!(bridge.operations().count(), 1);
        assert_eq!(bridge.ops[0].path, "new.path");
    }

    #[test]
    fn test_builder_defaults() {
        let builder = BridgeBuilder::new("node");
        assert_eq!(builder.call_timeout, Some(DEFAULT_CALL_TIMEOUT));
        assert_eq!(builder.teardown_grace, DEFAULT_TEARDOWN_GRACE);

        let builder = builder.no_call_timeout();
        assert_eq!(builder.call_timeout, None);
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let bridge = Bridge::builder("node").build();
        let err = bridge.invoke("nope", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownOperation(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_close_before_start_is_terminal() {
        let bridge = Bridge::builder("node")
            .operation("op", "some.path")
            .build();

        bridge.close().await;
        assert_eq!(bridge.pid(), None);

        let err = bridge.invoke("op", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Closed));

        let err = bridge.start().await.unwrap_err();
        assert!(matches!(err, BridgeError::Closed));

        // Close stays idempotent after the fact.
        bridge.close().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal_to_instance() {
        let bridge = Bridge::builder("definitely-not-a-real-binary")
            .operation("op", "some.path")
            .build();

        let err = bridge.invoke("op", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));

        // The instance must not retry the spawn.
        let err = bridge.invoke("op", &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Closed));
    }
}
