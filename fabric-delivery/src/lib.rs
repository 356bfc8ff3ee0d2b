//! Storage-backed delivery services: the per-org capacity gate, the
//! publish saga, and the notification dispatcher, plus the stores they
//! share (job executions, DLQ, outbox).
//!
//! Everything here runs against Postgres through sqlx. The pool
//! discipline is strict: no connection is ever held across external I/O —
//! pre-delivery state is committed, the client released, the adapter
//! called, and a second transaction finalizes.

pub mod adapters;
pub mod capacity;
pub mod dispatcher;
pub mod dlq;
pub mod executions;
pub mod idempotency_store;
pub mod notification;
pub mod outbox;
pub mod publish;
