//! External capabilities injected into the executor
//!
//! Generation and confirmation are opaque to the engine: it hands over a
//! prompt or a command string and takes back text or a yes/no answer.

use anyhow::Result;
use async_trait::async_trait;

/// Text/code generation backend
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Asks someone (or something) whether a command may run
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, command: &str) -> bool;
}

/// Adapts a synchronous closure into a [`Generator`]
pub struct FnGenerator<F>(pub F);

#[async_trait]
impl<F> Generator for FnGenerator<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    async fn generate(&self, prompt: &str) -> Result<String> {
        (self.0)(prompt)
    }
}

/// Adapts a synchronous closure into a [`Confirmer`]
pub struct FnConfirmer<F>(pub F);

#[async_trait]
impl<F> Confirmer for FnConfirmer<F>
where
    F: Fn(&str) -> bool + Send + Sync,
{
    async fn confirm(&self, command: &str) -> bool {
        (self.0)(command)
    }
}

/// Approves everything. For non-interactive runs the operator already vetted.
pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn confirm(&self, _command: &str) -> bool {
        true
    }
}
