//! Serde model of the Serverless Workflow DSL 1.0.0
//!
//! Documents parse from YAML or JSON into [`WorkflowDocument`]; the task
//! sum type [`TaskDefinition`] is the input to the node tree builder.

mod document;
mod duration;
mod flow;
mod task;

pub use document::{
    AuthenticationPolicy, BasicAuthentication, BearerAuthentication, DocumentMeta,
    DocumentParseError, OAuth2Authentication, OAuth2Client, UseCatalog, WorkflowDocument,
};
pub use duration::{DslDuration, DurationParseError, DurationParts};
pub use flow::FlowDirective;
pub use task::{
    BackoffClause, BackoffKind, CallTask, CatchClause, Correlation, DoTask, EmitClause, EmitEvent,
    EmitTask, ErrorDeclaration, ErrorFilter, ErrorFilterFields, EventFilter, ExportClause,
    ForClause, ForTask, ForkClause, ForkTask, InputClause, ListenClause, ListenRead, ListenTask,
    ListenTo, OutputClause, RaiseClause, RaiseError, RaiseTask, RetryDefinition, RetryLimit,
    RetryLimitAttempt, RetryRef, SchemaClause, SetTask, SwitchCase, SwitchTask, TaskCommon,
    TaskDefinition, TaskItem, TaskList, TimeoutClause, TryTask, WaitTask,
};
