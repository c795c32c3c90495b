//! Campaign artifacts on disk.
//!
//! A store is an output directory plus a model name. Files are named after
//! the model:
//!
//! - `name.par`  best parameters, `name value` per line, rewritten at every
//!   checkpoint
//! - `name.out`  textual run log and final summary
//! - `name.mon`  optional step trace, `step value` per line
//! - `name.rsy`  resynthesis results, `nllf v1 v2 ...` per successful repeat
//! - `name.json` the problem description

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::driver::FitResult;
use crate::error::{FitError, Result};
use crate::parameters::Parameters;
use crate::problem::ProblemSpec;

#[derive(Debug, Clone)]
pub struct FitStore {
    dir: PathBuf,
    name: String,
}

impl FitStore {
    /// Open a store in `dir` for model `name`.
    ///
    /// Refuses to reuse a directory that already holds a run log for this
    /// model unless `overwrite` is set; with `overwrite` the previous log,
    /// trace and resynthesis results are discarded.
    pub fn create(dir: impl AsRef<Path>, name: &str, overwrite: bool) -> Result<Self> {
        let store = Self {
            dir: dir.as_ref().to_path_buf(),
            name: name.to_string(),
        };
        fs::create_dir_all(&store.dir)?;

        let out = store.path("out");
        if out.exists() {
            if !overwrite {
                return Err(FitError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!(
                        "{} already exists; choose another store or overwrite it",
                        out.display()
                    ),
                )));
            }
            for ext in ["out", "mon", "rsy"] {
                let path = store.path(ext);
                if path.exists() {
                    fs::remove_file(&path)?;
                }
            }
            info!("overwriting store {}", store.dir.display());
        }
        File::create(&out)?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the artifact with extension `ext`
    pub fn path(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, ext))
    }

    /// Save the problem description as `name.json`.
    pub fn save_model(&self, spec: &ProblemSpec) -> Result<()> {
        fs::write(self.path("json"), serde_json::to_string_pretty(spec)?)?;
        Ok(())
    }

    /// Checkpoint the best parameters.
    ///
    /// The file is replaced atomically so a crash never leaves a truncated
    /// `.par` behind.
    pub fn write_par(&self, params: &Parameters) -> Result<()> {
        let tmp = self.path("par.tmp");
        fs::write(&tmp, params.to_par_string())?;
        fs::rename(&tmp, self.path("par"))?;
        debug!("checkpointed {}", self.path("par").display());
        Ok(())
    }

    /// Restore the last checkpoint into `params`; returns the number of
    /// values applied.
    pub fn load_par(&self, params: &mut Parameters) -> Result<usize> {
        params.load_par(self.path("par"))
    }

    /// Append a line to the run log.
    pub fn append_log(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path("out"))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Append the final summary of a fit to the run log.
    pub fn write_summary(&self, result: &FitResult) -> Result<()> {
        self.append_log(&result.to_string())
    }

    /// Writer for the step trace, truncating any previous trace.
    pub fn trace_writer(&self) -> Result<BufWriter<File>> {
        Ok(BufWriter::new(File::create(self.path("mon"))?))
    }

    /// Append one resynthesis result.
    pub fn append_resynth(&self, nllf: f64, point: &[f64]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path("rsy"))?;
        let mut line = nllf.to_string();
        for v in point {
            line.push(' ');
            line.push_str(&v.to_string());
        }
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read back every resynthesis result as `(nllf, point)`.
    pub fn read_resynth(&self) -> Result<Vec<(f64, Vec<f64>)>> {
        let path = self.path("rsy");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path)?;
        let mut rows = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let values = line
                .split_whitespace()
                .map(|t| t.parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| {
                    FitError::Schema(format!("{}:{}: {}", path.display(), line_no + 1, e))
                })?;
            if let Some((&nllf, point)) = values.split_first() {
                rows.push((nllf, point.to_vec()));
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params() -> Parameters {
        let mut params = Parameters::new();
        params.add_param_with_bounds("thickness", 125.5, 0.0, 500.0).unwrap();
        params.add_fixed("rho", 2.07).unwrap();
        params
    }

    #[test]
    fn test_store_refuses_reuse_without_overwrite() {
        let dir = tempdir().unwrap();
        let store = FitStore::create(dir.path(), "model", false).unwrap();
        store.append_log("first run").unwrap();

        match FitStore::create(dir.path(), "model", false) {
            Err(FitError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::AlreadyExists),
            other => panic!("expected AlreadyExists, got {:?}", other),
        }

        let store = FitStore::create(dir.path(), "model", true).unwrap();
        assert_eq!(fs::read_to_string(store.path("out")).unwrap(), "");
        assert!(FitStore::create(dir.path(), "other", false).is_ok());
    }

    #[test]
    fn test_par_checkpoint_round_trip() {
        let dir = tempdir().unwrap();
        let store = FitStore::create(dir.path(), "model", false).unwrap();
        let mut best = params();
        best.get_mut("thickness").unwrap().set_value(130.25).unwrap();
        store.write_par(&best).unwrap();
        assert!(!store.path("par.tmp").exists());

        let text = fs::read_to_string(store.path("par")).unwrap();
        assert_eq!(text, "thickness 130.25\nrho 2.07\n");

        let mut restored = params();
        assert_eq!(store.load_par(&mut restored).unwrap(), 2);
        assert_eq!(restored.get("thickness").unwrap().value(), 130.25);
    }

    #[test]
    fn test_resynth_lines() {
        let dir = tempdir().unwrap();
        let store = FitStore::create(dir.path(), "model", false).unwrap();
        assert!(store.read_resynth().unwrap().is_empty());
        store.append_resynth(1.5, &[1.0, 2.0]).unwrap();
        store.append_resynth(0.5, &[3.0, 4.0]).unwrap();

        let text = fs::read_to_string(store.path("rsy")).unwrap();
        assert_eq!(text, "1.5 1 2\n0.5 3 4\n");
        let rows = store.read_resynth().unwrap();
        assert_eq!(rows, vec![(1.5, vec![1.0, 2.0]), (0.5, vec![3.0, 4.0])]);
    }
}
