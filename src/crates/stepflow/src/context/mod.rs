//! Execution context, `{{key}}` templates and condition expressions

pub mod execution_context;
pub mod expression;
pub mod lexer;
pub mod template;

pub use execution_context::{step_key, ExecutionContext, Services};
pub use expression::{evaluate_bool, is_truthy, Expression, ExpressionError};
pub use template::{lookup, render_value};
