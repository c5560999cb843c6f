//! C4 Host Capability Bridge — spec §4.4.
//!
//! Every capability the sandbox can reach from script space is installed
//! here as a plain global object (`secrets`, `fetch`, `crypto`, `chain`)
//! rather than through QuickJS modules, mirroring how
//! `outlayer_rpc::host_functions` binds natively instead of going through a
//! WASI import table.

pub mod crypto;
pub mod fetch;
pub mod neo;
pub mod secrets;
pub mod validate;

use crate::error::EngineError;

/// Convert an [`EngineError`] into a catchable JS exception carrying the
/// stable error tag as a structured `.tag` property, so script-level
/// `try { ... } catch (e)` can branch on `e.tag` the same way a caller of the
/// facade branches on [`EngineError::tag`], without peeking at `e.message`.
pub fn throw_like(ctx: &rquickjs::Ctx<'_>, err: &EngineError) -> rquickjs::Error {
    let exception = rquickjs::Exception::from_message(ctx.clone(), &err.to_string()).unwrap();
    let _ = exception.set("tag", err.tag());
    ctx.throw(rquickjs::Value::from_exception(exception))
}
