use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "zipcap")]
#[command(version)]
#[command(about = "Memory-bounded streaming ZIP extractor", long_about = None)]
#[command(after_help = "Examples:\n  \
  zipcap data.zip -x '*.log'            extract everything except log files\n  \
  zipcap -l data.zip                    list archive contents\n  \
  zipcap data.zip --max-memory 64M      extract under a 64 MiB memory ceiling\n  \
  zipcap data.zip 'src/**/*.rs' -d out  extract matching entries into out/")]
pub struct Cli {
    /// ZIP file path
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Glob patterns selecting entries to extract (default: all)
    #[arg(value_name = "PATTERNS")]
    pub patterns: Vec<String>,

    /// List files (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Extract files into exdir
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<String>,

    /// Exclude entries matching these patterns
    #[arg(short = 'x', value_name = "PATTERN", num_args = 1..)]
    pub exclude: Vec<String>,

    /// Never overwrite existing files
    #[arg(short = 'n')]
    pub never_overwrite: bool,

    /// Overwrite files WITHOUT prompting
    #[arg(short = 'o')]
    pub overwrite: bool,

    /// Junk paths (do not make directories)
    #[arg(short = 'j')]
    pub junk_paths: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Memory ceiling for extraction, e.g. 512K, 64M, 2G
    #[arg(long = "max-memory", value_name = "SIZE", value_parser = parse_size)]
    pub max_memory: Option<u64>,

    /// High-water-mark for the extraction streams, e.g. 256K
    #[arg(long = "high-water-mark", value_name = "SIZE", value_parser = parse_size)]
    pub high_water_mark: Option<u64>,

    /// Maximum number of entries accepted per archive
    #[arg(long = "max-entries", value_name = "N")]
    pub max_entries: Option<u64>,

    /// Chunk size for large entries, e.g. 64K
    #[arg(long = "chunk-size", value_name = "SIZE", value_parser = parse_size)]
    pub chunk_size: Option<u64>,

    /// Process entries in parallel
    #[arg(long = "parallel")]
    pub parallel: bool,

    /// Worker bound in parallel mode (default 4)
    #[arg(long = "workers", value_name = "N", default_value_t = 0)]
    pub workers: usize,

    /// Keep going when an entry fails instead of aborting
    #[arg(long = "keep-going")]
    pub keep_going: bool,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }
}

/// Parse a human-friendly byte size: plain digits, or a K/M/G suffix.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1024u64),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: {s}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_sizes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
    }

    #[test]
    fn rejects_garbage_sizes() {
        assert!(parse_size("abc").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("99999999999G").is_err());
    }
}
