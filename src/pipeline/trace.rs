use std::path::{Path, PathBuf};

use anyhow::Context;

/// Dumps every request and raw response to disk, one file per chunk and direction.
pub struct TraceWriter {
    dir: PathBuf,
}

impl TraceWriter {
    pub fn new(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create trace dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_named_text(&self, name: &str, text: &str) -> anyhow::Result<PathBuf> {
        let path = self.dir.join(sanitize_filename(name));
        std::fs::write(&path, text).with_context(|| format!("write trace: {}", path.display()))?;
        Ok(path)
    }

    pub fn write_chunk_text(
        &self,
        doc_index: usize,
        document: &str,
        chunk: usize,
        kind: &str,
        text: &str,
    ) -> anyhow::Result<PathBuf> {
        let name = format!("{doc_index:04}_{document}.chunk{chunk:04}.{kind}.txt");
        self.write_named_text(&name, text)
    }
}

fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_files_are_flat_and_sanitized() {
        let dir = std::env::temp_dir().join(format!("epub-translator-trace-{}", std::process::id()));
        let trace = TraceWriter::new(dir.clone()).unwrap();
        let path = trace
            .write_chunk_text(2, "OEBPS/text/ch1.xhtml", 7, "request", "hello")
            .unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "0002_OEBPS_text_ch1.xhtml.chunk0007.request.txt"
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
