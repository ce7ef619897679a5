//! Terminal output helpers.

use canopy_core::{LogLine, LogSource, ServerInfo, ServerStatus};
use console::style;

pub fn status_label(status: ServerStatus) -> console::StyledObject<&'static str> {
    match status {
        ServerStatus::Running => style("running").green(),
        ServerStatus::Starting => style("starting").yellow(),
        ServerStatus::Error => style("error").red(),
        ServerStatus::Stopped => style("stopped").dim(),
    }
}

pub fn print_server(info: &ServerInfo) {
    let host = info.host.as_deref().unwrap_or("-");
    let pid = info
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<9} {:<15} pid {:<8} {}",
        status_label(info.status),
        host,
        pid,
        info.path
    );
    if let Some(proxy) = &info.proxy {
        let ports = proxy
            .ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        println!("          proxy {} on ports {}", proxy.status, ports);
    }
    if let Some(err) = &info.last_error {
        println!("          {}", style(err).red());
    }
}

pub fn print_servers(servers: &[ServerInfo]) {
    if servers.is_empty() {
        println!("{}", style("no managed dev servers").dim());
        return;
    }
    for info in servers {
        print_server(info);
    }
}

pub fn print_log_line(line: &LogLine) {
    match line.source {
        LogSource::Stdout => println!("{}", line.line),
        LogSource::Stderr => eprintln!("{}", style(&line.line).red()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_cover_all_states() {
        for status in [
            ServerStatus::Starting,
            ServerStatus::Running,
            ServerStatus::Stopped,
            ServerStatus::Error,
        ] {
            let label = status_label(status);
            assert!(!format!("{label}").is_empty());
        }
    }
}
