// file: src/op.rs
// description: Lifecycle shared by the CPU operators.
// author: cipher-rc5

use crate::error::Result;

/// Lifecycle hooks common to every CPU operator.
///
/// Shape propagation and execution stay on the concrete types: the RoPE
/// operator writes a caller-owned tensor while the KV cache hands back a
/// view of its own buffer.
pub trait Operator {
    fn name(&self) -> &str;

    /// Neither operator carries learned weights.
    fn load(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases operator-owned buffers.
    fn free(&mut self);
}
