pub use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Error, Result};

/// 在阻塞代码中检查取消标记
pub trait CancelExt {
    /// 已取消时返回 `Error::Cancelled`
    fn check(&self) -> Result<()>;
}

impl CancelExt for CancellationToken {
    fn check(&self) -> Result<()> {
        if self.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_cancels_on_drop() {
        let token = CancellationToken::new();
        {
            let _guard = token.clone().drop_guard();
            assert!(token.check().is_ok());
        }
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_disarmed_guard() {
        let token = CancellationToken::new();
        token.clone().drop_guard().disarm();
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_child_token_follows_parent() {
        let token = CancellationToken::new();
        let child = token.child_token();
        token.cancel();
        assert!(matches!(child.check(), Err(Error::Cancelled)));
    }
}
