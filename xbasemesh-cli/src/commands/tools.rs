//! The tools command: show resolved tool commands and observed versions.

use clap::Args;

use xbasemesh::tools::probe_version;
use xbasemesh::BuildError;

use super::common::Common;

#[derive(Args)]
pub struct ToolsArgs {
    /// Skip version probing (no tool is executed).
    #[arg(long)]
    no_probe: bool,
}

pub fn run(common: &Common, args: ToolsArgs) -> i32 {
    match execute(common, args) {
        Ok(code) => code,
        Err(e) => common.fail(&e),
    }
}

fn execute(common: &Common, args: ToolsArgs) -> Result<i32, BuildError> {
    let resolved = common.resolve()?;
    let commands = resolved.tools.plan_commands();
    if commands.is_empty() {
        return Err(BuildError::invalid_with_hint(
            "no tools configured",
            "create a tool_paths.json ({\"dsftool\": [...], \"runner\": [...]})",
        ));
    }

    let tools = [
        ("dsftool", &resolved.tools.dsftool),
        ("ddstool", &resolved.tools.ddstool),
        ("runner", &resolved.tools.runner),
        ("sevenzip", &resolved.tools.sevenzip),
    ];
    for (name, command) in tools {
        let Some(command) = command else { continue };
        let version = if args.no_probe {
            None
        } else {
            probe_version(command)
        };
        if common.json_logs {
            let line = serde_json::json!({
                "tool": name,
                "argv": command.resolved().argv(),
                "version": version,
            });
            println!("{line}");
        } else {
            println!(
                "{name}: {} (version: {})",
                command.resolved().argv().join(" "),
                version.as_deref().unwrap_or("unknown")
            );
        }
    }
    Ok(0)
}
