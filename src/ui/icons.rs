//! Shared UI icons.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[||]");
pub static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[STOP]");
pub static CHOICE: Emoji<'_, '_> = Emoji("👉 ", "[?]");
pub static PLAN: Emoji<'_, '_> = Emoji("🗺️  ", "[PLAN]");
