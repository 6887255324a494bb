//! QR payloads from a line-oriented source.
//!
//! USB and serial QR scanners present themselves as keyboards or character
//! devices that emit one line per code, and camera decoders can be piped in
//! through a FIFO. Either way every line is one scan.

use std::{
    path::{Path, PathBuf},
    pin::Pin,
    time::Duration,
};

use tokio::{
    fs::File,
    io::{self, AsyncBufReadExt, AsyncRead, BufReader, Lines},
    time::Instant,
};

use crate::error::Result;

type Reader = Pin<Box<dyn AsyncRead + Send>>;

/// Drops repeated scans of the same payload.
///
/// A code held in front of the scanner is read over and over; it is only
/// accepted again once it was out of sight for the cooldown.
#[derive(Clone, Debug)]
pub struct Deduplicator {
    cooldown: Duration,
    last: Option<(String, Instant)>,
}

impl Deduplicator {
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: None,
        }
    }

    pub fn accept(&mut self, payload: &str, at: Instant) -> bool {
        let repeated = self.last.as_ref().is_some_and(|(last, seen)| {
            last == payload && at.saturating_duration_since(*seen) < self.cooldown
        });

        self.last = Some((payload.to_owned(), at));
        !repeated
    }
}

pub struct Scanner {
    path: Option<PathBuf>,
    lines: Lines<BufReader<Reader>>,
    dedup: Deduplicator,
}

impl Scanner {
    /// Opens the scanner at `path`, or standard input for `None` and `-`.
    ///
    /// # Errors
    ///
    /// Returns error if `path` cannot be opened.
    pub async fn open(path: Option<&Path>, cooldown: Duration) -> Result<Self> {
        let path = path.filter(|path| *path != Path::new("-"));
        let reader = Self::reader(path).await?;

        match path {
            Some(path) => info!("reading scans from {}", path.display()),
            None => info!("reading scans from standard input"),
        }

        Ok(Self {
            path: path.map(Path::to_path_buf),
            lines: BufReader::new(reader).lines(),
            dedup: Deduplicator::new(cooldown),
        })
    }

    #[must_use]
    pub fn from_reader<R>(reader: R, cooldown: Duration) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            path: None,
            lines: BufReader::new(Box::pin(reader) as Reader).lines(),
            dedup: Deduplicator::new(cooldown),
        }
    }

    async fn reader(path: Option<&Path>) -> Result<Reader> {
        let reader: Reader = match path {
            Some(path) => Box::pin(File::open(path).await?),
            None => Box::pin(io::stdin()),
        };
        Ok(reader)
    }

    /// Waits for the next new scan. Returns `None` when the source is
    /// exhausted.
    ///
    /// A FIFO is reopened when its writer goes away.
    ///
    /// # Errors
    ///
    /// Returns error if reading fails.
    pub async fn next_scan(&mut self) -> Result<Option<String>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                if self.reopen().await? {
                    continue;
                }
                return Ok(None);
            };

            let payload = line.trim();
            if payload.is_empty() {
                continue;
            }

            if self.dedup.accept(payload, Instant::now()) {
                return Ok(Some(payload.to_owned()));
            }
            trace!("ignoring repeated scan: {payload}");
        }
    }

    #[cfg(unix)]
    async fn reopen(&mut self) -> Result<bool> {
        use std::os::unix::fs::FileTypeExt;

        let Some(ref path) = self.path else {
            return Ok(false);
        };
        if !tokio::fs::metadata(path).await?.file_type().is_fifo() {
            return Ok(false);
        }

        debug!("{}: writer closed, reopening", path.display());
        self.lines = BufReader::new(Self::reader(Some(path.as_path())).await?).lines();
        Ok(true)
    }

    #[cfg(not(unix))]
    async fn reopen(&mut self) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown() {
        let mut dedup = Deduplicator::new(Duration::from_secs(3));
        let start = Instant::now();

        assert!(dedup.accept("a", start));
        assert!(!dedup.accept("a", start + Duration::from_secs(1)));
        // Still in view: the cooldown restarts.
        assert!(!dedup.accept("a", start + Duration::from_secs(3)));
        assert!(dedup.accept("a", start + Duration::from_secs(7)));

        assert!(dedup.accept("b", start + Duration::from_secs(7)));
        assert!(dedup.accept("a", start + Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn lines() {
        let input: &[u8] = b"spotify:track:a\n\n  \nspotify:track:a\r\nhttps://open.spotify.com/album/b\n";
        let mut scanner = Scanner::from_reader(input, Duration::from_secs(3));

        assert_eq!(
            scanner.next_scan().await.unwrap().as_deref(),
            Some("spotify:track:a")
        );
        assert_eq!(
            scanner.next_scan().await.unwrap().as_deref(),
            Some("https://open.spotify.com/album/b")
        );
        assert_eq!(scanner.next_scan().await.unwrap(), None);
    }
}
