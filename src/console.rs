//! Colorful console output for plans and engine lifecycle.

use num_format::{Locale, ToFormattedString};
use owo_colors::OwoColorize;

use crate::planner::{PlanOutcome, SlaCompliance};

/// ASCII art banner for server startup.
pub fn print_banner() {
    let banner = r#"
  _____ _           _     ____  _                 _       _
 |  ___| | ___  ___| |_  |  _ \(_)___ _ __   __ _| |_ ___| |__
 | |_  | |/ _ \/ _ \ __| | | | | / __| '_ \ / _` | __/ __| '_ \
 |  _| | |  __/  __/ |_  | |_| | \__ \ |_) | (_| | || (__| | | |
 |_|   |_|\___|\___|\__| |____/|_|___/ .__/ \__,_|\__\___|_| |_|
                                     |_|
"#;
    println!("{}", banner.cyan().bold());
    println!(
        "  {} {}\n",
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_black(),
        "SLA-aware dispatch".bright_cyan()
    );
}

/// Prints the fleet loaded at startup.
pub fn print_fleet(vehicles: usize, pickups: usize, orders: usize) {
    println!(
        "{} {} {} Fleet: vehicles ({}), pickups ({}), orders ({})",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Fleet]".bright_cyan(),
        vehicles.to_formatted_string(&Locale::en).bright_yellow(),
        pickups.to_formatted_string(&Locale::en).bright_yellow(),
        orders.to_formatted_string(&Locale::en).bright_yellow()
    );
}

/// Prints an engine lifecycle transition.
pub fn print_engine_event(engine: &str, event: &str) {
    println!(
        "{} {} {} {}",
        timestamp().bright_black(),
        "INFO".bright_green(),
        format!("[{}]", engine).bright_cyan(),
        event.white().bold()
    );
}

/// Prints a boxed summary of one plan.
pub fn print_plan_summary(outcome: &PlanOutcome) {
    // 60 chars wide, 56 char content area
    println!();
    println!("{}", "╔══════════════════════════════════════════════════════════╗".bright_cyan());

    let status_text = match outcome.sla_compliance {
        SlaCompliance::AllCompliant => "✓ ALL ROUTES WITHIN SLA",
        SlaCompliance::AtRisk => "! ROUTES CLOSE TO SLA DEADLINE",
        SlaCompliance::Violated => "✗ DELIVERIES OUTSIDE SLA",
    };
    let status_colored = match outcome.sla_compliance {
        SlaCompliance::AllCompliant => status_text.bright_green().bold().to_string(),
        SlaCompliance::AtRisk => status_text.yellow().bold().to_string(),
        SlaCompliance::Violated => status_text.bright_red().bold().to_string(),
    };
    let status_padding = 56usize.saturating_sub(status_text.chars().count());
    let left_pad = status_padding / 2;
    let right_pad = status_padding - left_pad;
    println!(
        "{}{}{}{}{}",
        "║".bright_cyan(),
        " ".repeat(left_pad),
        status_colored,
        " ".repeat(right_pad),
        "║".bright_cyan()
    );

    println!("{}", "╠══════════════════════════════════════════════════════════╣".bright_cyan());

    let rows = [
        ("Source:", format!("{:?} ({})", outcome.source, outcome.summary.strategy)),
        ("Routes:", outcome.routes.len().to_formatted_string(&Locale::en)),
        ("Vehicles Used:", outcome.vehicles_used().to_formatted_string(&Locale::en)),
        ("Unassigned:", outcome.unassigned_deliveries.len().to_formatted_string(&Locale::en)),
        ("Total Distance:", format!("{:.1} km", outcome.summary.total_distance_km)),
        ("Longest Route:", format_minutes(outcome.max_route_duration_minutes)),
        ("Utilization:", format!("{:.1}%", outcome.summary.capacity_utilization)),
    ];
    for (label, value) in rows {
        println!(
            "{}  {:<18}{:>36}  {}",
            "║".bright_cyan(),
            label,
            value,
            "║".bright_cyan()
        );
    }

    println!("{}", "╚══════════════════════════════════════════════════════════╝".bright_cyan());
    println!();
}

/// Formats minutes as `Xh Ym`.
fn format_minutes(minutes: i64) -> String {
    if minutes < 60 {
        format!("{}m", minutes)
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

/// Returns a timestamp string.
fn timestamp() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| format!("{}.{:03}", d.as_secs(), d.subsec_millis()))
        .unwrap_or_else(|_| "0.000".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_format() {
        assert_eq!(format_minutes(45), "45m");
        assert_eq!(format_minutes(135), "2h 15m");
    }
}
