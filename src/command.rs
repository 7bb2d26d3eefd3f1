pub mod aggregate;
pub mod modes;
pub mod print_completions;
pub mod run;

pub use aggregate::aggregate;
pub use modes::modes;
pub use print_completions::print_completions;
pub use run::run;

const PROGRESS_CHARS: &str = "##-";
