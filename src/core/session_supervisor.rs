//! 会话监管：生命周期与中断管理
//!
//! 持有根 CancellationToken；每个回合派生子 token，用户取消时整体触发。

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理
#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消：所有在途回合与执行收到信号
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// 为单个回合创建子 token
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
