//! Version command implementation.

use console::style;

/// Execute the version command.
pub fn execute() {
    let version = env!("CARGO_PKG_VERSION");

    println!(
        "{} {} - per-plane job dispatch to remote batch clusters",
        style("Planar").cyan().bold(),
        style(format!("v{version}")).yellow()
    );
    println!();
    println!("Components:");
    println!("  planar-sched   Path translation, SSH sessions and dispatch");
    println!("  planar-cli     Command-line interface");
    println!();
    println!("License:    {}", style("Apache-2.0").dim());
}
