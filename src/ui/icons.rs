//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");

// Workflow stages
pub static FORK: Emoji<'_, '_> = Emoji("🍴 ", "[FORK]");
pub static BRANCH: Emoji<'_, '_> = Emoji("🌿 ", "[BR]");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "[DEPLOY]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static LINK: Emoji<'_, '_> = Emoji("🔗 ", "->");
