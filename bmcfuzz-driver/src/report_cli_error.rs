// SPDX-License-Identifier: Apache-2.0

use bmcfuzz::BmcfuzzError;
use colored::Colorize;

pub fn report_cli_error_and_exit(
    message: &str,
    subcommand: Option<&str>,
    details: Vec<(&str, &str)>,
) -> ! {
    let prefix = subcommand.map(|s| format!("{}: ", s)).unwrap_or_default();
    eprintln!("bmcfuzz-driver: {}{}", prefix, message.red().bold());
    for (key, value) in details {
        eprintln!("  {}: {}", key, value);
    }
    std::process::exit(1);
}

/// Reports a configuration or setup failure, with the variant's fields as
/// detail lines.
pub fn report_bmcfuzz_error_and_exit(
    error: &BmcfuzzError,
    subcommand: Option<&str>,
    details: Vec<(&str, &str)>,
) -> ! {
    let mut owned: Vec<(&str, String)> = details
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();
    let headline = match error {
        BmcfuzzError::Io { context, source } => {
            owned.push(("cause", source.to_string()));
            context.clone()
        }
        BmcfuzzError::PointOutOfRange { point, total } => {
            owned.push(("point", point.to_string()));
            owned.push(("total", total.to_string()));
            "point out of range".to_string()
        }
        BmcfuzzError::LengthMismatch { expected, got } => {
            owned.push(("expected", expected.to_string()));
            owned.push(("got", got.to_string()));
            "coverage vector length mismatch".to_string()
        }
        BmcfuzzError::Parse(msg) | BmcfuzzError::Setup(msg) => msg.clone(),
        BmcfuzzError::Interrupted => "interrupted".to_string(),
    };
    let borrowed: Vec<(&str, &str)> = owned.iter().map(|(k, v)| (*k, v.as_str())).collect();
    report_cli_error_and_exit(&headline, subcommand, borrowed)
}
