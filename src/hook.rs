//! Narrow contract of the external inline-hook engine.

use crate::cpu::HookRegisterContext;
use crate::range::Address;
use crate::result::Result;

/// Receives the redirected function entry. `original` is the unhooked entry
/// point the trampoline preserved; `ctx` is the raw register context the
/// trampoline spilled, and writes to it flow back into the resumed caller.
pub trait EntryHandler {
    fn on_entry(&mut self, original: Address, ctx: &mut HookRegisterContext);
}

/// The inline-hook engine. `instrument` redirects `address` to a trampoline
/// that drives `handler`; the handler runs synchronously on the thread that
/// entered the hooked function.
pub trait InlineHookEngine {
    fn instrument(&mut self, address: Address, handler: &mut dyn EntryHandler) -> Result<()>;
}
