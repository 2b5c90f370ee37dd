pub const SPECPRIMER_DISPLAY_VERSION: &str = env!("SPECPRIMER_DISPLAY_VERSION");
pub const SPECPRIMER_BUILD_N: &str = env!("SPECPRIMER_BUILD_N");

pub fn version_cli_text() -> String {
    format!(
        "specprimer {}\nBuild {}\nBLAST result interpretation for species-specific primer design",
        SPECPRIMER_DISPLAY_VERSION, SPECPRIMER_BUILD_N
    )
}
