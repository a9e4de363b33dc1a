//! Lazily-built effect pipelines over a flat step list with an explicit cursor.
//!
//! A [`Task`] records steps as it is composed and runs nothing until awaited.
//! The interpreter walks the list with a cursor, carrying one success slot and
//! one failure slot; combinators install position-keyed hooks that rewind the
//! cursor (`repeat`, `retry_while`, `sequence_from_iter`, `flat`), fast-forward
//! past the rest of the list (`throttle`, `filter`), or run terminal cleanup
//! (`ensure`, `collect_when`).
//!
//! - `succeed` / `fail` / `from_callback` start a pipeline
//! - `map` / `try_map` / `map_async` / `chain` transform it
//! - `access` / `provide` move capabilities through the environment
//! - `timeout` kills a run out of band when a deadline passes
//! - `struct_of` / `struct_par` aggregate named sub-pipelines
//! - [`Queue`] feeds long-lived pipelines via `sequence_from_stream`
//!
//! # Example
//! ```
//! use riptide_pipeline::Task;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let doubled = Task::succeed(21)
//!     .map(|n: i32| n * 2)
//!     .run()
//!     .await
//!     .unwrap();
//! assert_eq!(doubled, 42);
//! # }
//! ```

mod compose;
mod control;
mod hooks;
mod queue;
mod runtime;
mod step;
mod task;

pub use queue::{Queue, QueueStream};
pub use task::{Resolver, Task};
