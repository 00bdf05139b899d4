// Colored terminal output for `guardstream check`.
//
// Prints the same lines the streaming endpoints emit, colored by risk level,
// as events arrive.

use colored::{ColoredString, Colorize};

use crate::guard::traits::RiskLevel;
use crate::moderation::events::ModerationEvent;

fn colorize_line(line: &str, level: RiskLevel) -> ColoredString {
    match level {
        RiskLevel::Safe => line.green(),
        RiskLevel::Controversial => line.yellow(),
        RiskLevel::Unsafe => line.red().bold(),
    }
}

/// Print one moderation event. Returns false once a terminal event is seen.
pub fn display_event(event: &ModerationEvent, header_shown: &mut bool) -> bool {
    match event {
        ModerationEvent::User(verdict) => {
            print!("{}", colorize_line(&event.summary_line(), verdict.risk_level));
            true
        }
        ModerationEvent::AssistantToken(token) => {
            if !*header_shown {
                *header_shown = true;
                println!("{}", "Assistant streaming moderation:".bold());
            }
            print!(
                "{}",
                colorize_line(&event.summary_line(), token.verdict.risk_level)
            );
            true
        }
        ModerationEvent::Done => {
            println!("{}", "Done.".dimmed());
            false
        }
        ModerationEvent::Error(_) => {
            println!("{}", event.summary_line().red().bold());
            false
        }
    }
}
