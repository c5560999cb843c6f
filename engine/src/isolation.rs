//! C3 Isolation Manager — spec §4.3.
//!
//! Redesigned per spec §9 from "dynamic prototype freezing and global
//! stripping" into a small static policy table plus a prelude string
//! evaluated into every fresh context, the same shape as
//! `outlayer-quickjs-executor`'s fixed `LOADER_MJS` loader script.

use crate::error::EngineError;
use rquickjs::{Ctx, Object};

/// Globals removed from every fresh context before user code can see them.
/// `eval` and the `Function` constructor are QuickJS's two paths to
/// dynamically compiled code; timers and any network primitive other than
/// the mediated `fetch` binding are not installed in the first place by C4,
/// but are listed here defensively in case a future QuickJS build adds them.
pub const DENIED_GLOBALS: &[&str] = &[
    "eval",
    "Function",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "WebAssembly",
];

/// Built-in prototypes frozen after setup so user code cannot pollute them
/// across... there is no "across" in a one-shot sandbox, but freezing still
/// blocks a script from rewriting e.g. `Array.prototype.push` mid-execution
/// to subvert later validation logic in the very same call.
pub const FROZEN_PROTOTYPES: &[&str] = &[
    "Object", "Array", "String", "Number", "Boolean", "Function", "Promise", "Error",
];

fn build_prelude() -> String {
    let mut out = String::new();
    for name in DENIED_GLOBALS {
        out.push_str(&format!(
            "try {{ delete globalThis.{name}; }} catch (e) {{}}\n"
        ));
    }
    for ctor in FROZEN_PROTOTYPES {
        out.push_str(&format!("Object.freeze({ctor}.prototype);\n"));
    }
    out
}

/// Read-only execution context visible to the script, spec §4.3 (iv).
pub struct ExecutionIdentity {
    pub function_id: String,
    pub principal_id: String,
    pub execution_id: String,
}

/// Run isolation setup against a fresh context: strict semantics are
/// QuickJS's default at the top level of a `<script>`-mode eval, so (i) falls
/// out of how C5 wraps the source (an IIFE starting with `"use strict"`).
/// Failure here is fatal to the execution per spec §4.3 and must be mapped to
/// `capability_denied` by the caller without running user code.
pub fn setup(ctx: &Ctx<'_>, identity: &ExecutionIdentity) -> Result<(), EngineError> {
    install_execution_context(ctx, identity)?;

    ctx.eval::<(), _>(build_prelude())
        .map_err(|e| EngineError::CapabilityDenied(format!("isolation setup failed: {e}")))?;

    Ok(())
}

/// Freeze `globalThis` itself so the script can neither rebind a capability
/// (`fetch = somethingElse`) nor leak new bindings onto the global object.
/// Must run only after every C4 binding has been installed — freezing first
/// would make the global object non-extensible and every later
/// `ctx.globals().set(...)` call would fail.
pub fn lock_globals(ctx: &Ctx<'_>) -> Result<(), EngineError> {
    ctx.eval::<(), _>("Object.freeze(globalThis);")
        .map_err(|e| EngineError::Internal(format!("failed to lock globals: {e}")))
}

fn install_execution_context(
    ctx: &Ctx<'_>,
    identity: &ExecutionIdentity,
) -> Result<(), EngineError> {
    let obj = Object::new(ctx.clone())
        .map_err(|e| EngineError::Internal(format!("failed to build executionContext: {e}")))?;
    obj.set("functionId", identity.function_id.clone())
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    obj.set("principalId", identity.principal_id.clone())
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    obj.set("executionId", identity.execution_id.clone())
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    ctx.globals()
        .set("executionContext", obj)
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    // Freeze after population so the script cannot rebind its own identity.
    ctx.eval::<(), _>("Object.freeze(executionContext);")
        .map_err(|e| EngineError::Internal(format!("failed to freeze executionContext: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn prelude_freezes_array_prototype() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            setup(
                &ctx,
                &ExecutionIdentity {
                    function_id: "f1".into(),
                    principal_id: "p1".into(),
                    execution_id: "e1".into(),
                },
            )
            .unwrap();

            let result: bool = ctx
                .eval(
                    r#"
                    (function () {
                        Array.prototype.push = function () { return "owned"; };
                        return Array.prototype.push === Array.prototype.push;
                    })()
                    "#,
                )
                .unwrap();
            // Assignment is a silent no-op in non-strict sloppy mode but the
            // prototype method itself must remain the built-in one.
            assert!(result);

            let is_native: bool = ctx
                .eval("typeof Array.prototype.push === 'function'")
                .unwrap();
            assert!(is_native);
        });
    }

    #[test]
    fn denied_globals_are_removed() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            setup(
                &ctx,
                &ExecutionIdentity {
                    function_id: "f1".into(),
                    principal_id: "p1".into(),
                    execution_id: "e1".into(),
                },
            )
            .unwrap();

            let has_eval: bool = ctx.eval("typeof eval === 'undefined'").unwrap();
            assert!(has_eval);
        });
    }

    #[test]
    fn execution_context_is_frozen_and_populated() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            setup(
                &ctx,
                &ExecutionIdentity {
                    function_id: "func-1".into(),
                    principal_id: "principal-1".into(),
                    execution_id: "exec-1".into(),
                },
            )
            .unwrap();

            let function_id: String = ctx.eval("executionContext.functionId").unwrap();
            assert_eq!(function_id, "func-1");

            let frozen: bool = ctx.eval("Object.isFrozen(executionContext)").unwrap();
            assert!(frozen);
        });
    }

    #[test]
    fn lock_globals_blocks_new_bindings_but_not_iife_locals() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            setup(
                &ctx,
                &ExecutionIdentity {
                    function_id: "f1".into(),
                    principal_id: "p1".into(),
                    execution_id: "e1".into(),
                },
            )
            .unwrap();

            ctx.globals().set("capability", 1).unwrap();
            lock_globals(&ctx).unwrap();

            assert!(ctx.globals().set("lateCapability", 1).is_err());

            // A function declared inside an IIFE is a local binding, not a
            // property of globalThis, so a frozen global object does not
            // stop the wrapped-source pattern C5 relies on.
            let result: i32 = ctx
                .eval(
                    r#"
                    (function () {
                        function main(x) { return x + 1; }
                        return main(41);
                    })()
                    "#,
                )
                .unwrap();
            assert_eq!(result, 42);
        });
    }
}
