//! Consumed tracing interface.
//!
//! Executors open spans around workflow, stage, and agent boundaries so that
//! callers can export timing data to whatever tracing system they run.  The
//! exporter is out of scope; the engine consumes this start/attribute/end
//! surface and ships a no-op implementation as the default.
//!
//! # Span names
//!
//! - `workflow.<pattern>`: one per execution
//! - `<pattern>.stage.<n>` / `<pattern>.branch.<n>` / `<pattern>.agent.<id>`:
//!   per unit of work
//! - `workflow.structured_context.{init,build_prompt,parse_output}`: the
//!   iterative executor's context phases

/// A single in-flight span.
///
/// Spans are ended explicitly via [`TraceSpan::end`]; implementations should
/// also end on drop so early returns do not leak open spans.
pub trait TraceSpan: Send {
    /// Attach a key/value attribute to the span.
    fn set_attribute(&mut self, key: &str, value: &str);

    /// Close the span.  Calling `end` more than once is a no-op.
    fn end(&mut self);
}

/// Trait defining the tracer surface the engine consumes.
pub trait Tracer: Send + Sync {
    /// Open a span with the given name.
    fn start_span(&self, name: &str) -> Box<dyn TraceSpan>;
}

/// Tracer that records nothing.  Installed by default on the orchestrator.
#[derive(Debug, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl TraceSpan for NoopSpan {
    fn set_attribute(&mut self, _key: &str, _value: &str) {}
    fn end(&mut self) {}
}

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str) -> Box<dyn TraceSpan> {
        Box::new(NoopSpan)
    }
}
