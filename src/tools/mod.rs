pub mod attach;
pub mod delegate;
pub mod file_edit;
pub mod file_read;
pub mod file_write;
pub mod shell;
pub mod traits;

pub use attach::AttachTool;
pub use delegate::DelegateTool;
pub use file_edit::FileEditTool;
pub use file_read::FileReadTool;
pub use file_write::FileWriteTool;
pub use shell::BashTool;
pub use traits::{arg_label, Tool, ToolOutcome, ToolSpec};

use crate::sandbox::Sandbox;
use crate::security::SecurityPolicy;
use crate::transport::ChatTransport;
use std::path::Path;
use std::sync::Arc;

/// Build the per-channel tool registry. Tool instances are owned by their
/// runner; `attach` is bound to the channel it uploads into.
pub fn all_tools(
    policy: &Arc<SecurityPolicy>,
    sandbox: &Arc<dyn Sandbox>,
    transport: &Arc<dyn ChatTransport>,
    channel_id: &str,
    workspace_dir: &Path,
    agent_cmd: Option<Vec<String>>,
) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(FileReadTool::new(policy.clone(), sandbox.clone())),
        Arc::new(FileWriteTool::new(policy.clone(), sandbox.clone())),
        Arc::new(FileEditTool::new(policy.clone(), sandbox.clone())),
        Arc::new(BashTool::new(policy.clone(), sandbox.clone())),
        Arc::new(AttachTool::new(
            policy.clone(),
            sandbox.clone(),
            transport.clone(),
            channel_id.to_string(),
        )),
    ];
    if let Some(agent_cmd) = agent_cmd {
        tools.push(Arc::new(DelegateTool::new(
            workspace_dir.to_path_buf(),
            agent_cmd,
        )));
    }
    tools
}
