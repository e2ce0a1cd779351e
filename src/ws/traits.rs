//! Seams between the generic connection core and its collaborators.

use super::envelope::Envelope;

/// Turns a push frame into a domain event.
///
/// The dispatch loop calls the parser once per push frame, before any handler runs.
/// A parse error is logged and the frame is skipped. `Ok(None)` drops the frame
/// without logging, for frames the application has no interest in.
///
/// # Example
///
/// ```ignore
/// pub struct OpcodeParser;
///
/// impl EventParser<Opcode> for OpcodeParser {
///     fn parse(&self, envelope: &Envelope) -> crate::Result<Option<Opcode>> {
///         Ok(Some(envelope.opcode))
///     }
/// }
/// ```
pub trait EventParser<E>: Send + Sync + 'static {
    fn parse(&self, envelope: &Envelope) -> crate::Result<Option<E>>;
}

/// Passes push frames through untouched.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawParser;

impl EventParser<Envelope> for RawParser {
    fn parse(&self, envelope: &Envelope) -> crate::Result<Option<Envelope>> {
        Ok(Some(envelope.clone()))
    }
}
