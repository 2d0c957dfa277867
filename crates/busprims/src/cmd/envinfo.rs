use std::collections::BTreeMap;

use busprims_link::{Interface, LinkConfig, LinkMode, SIMULATION_ENV};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::cmd::EnvinfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

const REPORTED_VARS: [&str; 3] = [SIMULATION_ENV, "BUSPRIMS_CONFIG", "RUST_LOG"];

#[derive(Serialize)]
struct EnvInfoOutput {
    schema_id: &'static str,
    version: &'static str,
    target: String,
    /// Mode an online link opened now would run in.
    mode: LinkMode,
    interfaces: Vec<Interface>,
    defaults: LinkConfig,
    environment: BTreeMap<&'static str, Option<String>>,
}

impl EnvInfoOutput {
    fn collect() -> Self {
        Self {
            schema_id: "https://schemas.3leaps.dev/busprims/cli/v1/envinfo.schema.json",
            version: env!("CARGO_PKG_VERSION"),
            target: target_triple(),
            mode: LinkMode::Online.effective(),
            interfaces: available_interfaces(),
            defaults: LinkConfig::default(),
            environment: REPORTED_VARS
                .into_iter()
                .map(|name| (name, std::env::var(name).ok()))
                .collect(),
        }
    }

    fn rows(&self) -> Vec<[String; 2]> {
        let interfaces: Vec<&str> = self.interfaces.iter().map(|i| i.as_str()).collect();
        let delays = &self.defaults.delays;
        let mut rows = vec![
            ["version".to_string(), self.version.to_string()],
            ["target".to_string(), self.target.clone()],
            ["mode".to_string(), mode_name(self.mode).to_string()],
            ["interfaces".to_string(), interfaces.join(", ")],
            [
                "max message".to_string(),
                format!("{} bytes", self.defaults.max_message_len),
            ],
            [
                "accept timeout".to_string(),
                format!("{} us", self.defaults.accept_timeout_us),
            ],
            [
                "send spacing".to_string(),
                format!(
                    "{}/{}/{} ms after send/receive/srq",
                    delays.send_after_send_ms,
                    delays.send_after_receive_ms,
                    delays.send_after_srq_ms
                ),
            ],
        ];
        for (name, value) in &self.environment {
            let value = value.as_deref().unwrap_or("(not set)");
            rows.push([name.to_string(), value.to_string()]);
        }
        rows
    }
}

pub fn run(_args: EnvinfoArgs, format: OutputFormat) -> CliResult<i32> {
    let output = EnvInfoOutput::collect();
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&output).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KEY", "VALUE"])
                .add_rows(output.rows());
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("busprims environment\n");
            for [key, value] in output.rows() {
                println!("  {key:<16} {value}");
            }
        }
        OutputFormat::Raw => println!("{}", output.version),
    }
    Ok(SUCCESS)
}

fn mode_name(mode: LinkMode) -> &'static str {
    match mode {
        LinkMode::Online => "online",
        LinkMode::Offline => "offline",
        LinkMode::Simulation => "simulation",
    }
}

fn target_triple() -> String {
    if let Some(target) = option_env!("BUSPRIMS_BUILD_TARGET") {
        return target.to_string();
    }
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

fn available_interfaces() -> Vec<Interface> {
    if cfg!(unix) {
        vec![
            Interface::Gpib,
            Interface::Lan,
            Interface::LanServer,
            Interface::Rs232,
        ]
    } else {
        vec![Interface::Gpib]
    }
}
