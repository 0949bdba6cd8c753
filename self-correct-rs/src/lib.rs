// self-correct-rs/src/lib.rs
// Self-Correction Engine for the constitutional validation pipeline.
//
// Design notes:
// - Every task ends in exactly one of ACCEPTED, ESCALATED or REJECTED.
// - The number of generation attempts never exceeds the configured bound;
//   nothing outside the engine retries.
// - Escalation is a fire-and-forget hand-off to an `EscalationQueue`; a
//   refused ticket is held and redelivered, never dropped.

pub mod engine;
pub mod escalation;
pub mod structural;
pub mod verifier;


pub use engine::{outcome_error, CorrectionEngine};
pub use escalation::{
    queue_from_config, EscalationQueue, FileEscalationQueue, InMemoryEscalationQueue, OutboxQueue,
    QueueError,
};
pub use structural::{structural_check, STRUCTURAL_PRINCIPLE};
pub use verifier::{execution_diagnosis, ExecutableVerifier, TestRunResult, VerifierError, EXECUTION_PRINCIPLE};
