//! Coverage-bin selection: derive low/high depth thresholds from the peak
//! table the normalization stage wrote, then re-run bbnorm to keep only the
//! reads whose estimated depth falls inside that band.

use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Stdio,
};

use tempfile::TempDir;
use tokio::process::Command as TokioCommand;

use crate::error::{PipelineError, Result};

pub const DEFAULT_CPUS: u32 = 1;
pub const DEFAULT_RAM_LIMIT_BYTES: u64 = 4_000_000_000;

const PEAKS_FILENAME: &str = "peaks.txt";

/// Resource sizing for the bbnorm call. Built explicitly, or from the
/// cluster-assigned environment when running under a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub cpus: u32,
    /// Scheduler-style per-CPU allocation, in megabytes.
    pub mem_per_cpu_mb: Option<u64>,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: DEFAULT_CPUS,
            mem_per_cpu_mb: None,
        }
    }
}

impl Resources {
    pub fn from_env() -> Self {
        Self::from_vars(
            env::var("SLURM_JOB_CPUS_PER_NODE").ok().as_deref(),
            env::var("SLURM_MEM_PER_CPU").ok().as_deref(),
        )
    }

    pub fn from_vars(cpus: Option<&str>, mem_per_cpu_mb: Option<&str>) -> Self {
        let mut resources = Self::default();

        if let Some(value) = cpus {
            match value.parse() {
                Ok(n) => resources.cpus = n,
                Err(_) => log::warn!("Ignoring unparseable CPU count '{}'", value),
            }
        }

        if let Some(value) = mem_per_cpu_mb {
            match value.parse() {
                Ok(mb) => resources.mem_per_cpu_mb = Some(mb),
                Err(_) => log::warn!("Ignoring unparseable per-CPU memory '{}'", value),
            }
        }

        resources
    }

    pub fn ram_limit_bytes(&self) -> u64 {
        match self.mem_per_cpu_mb {
            Some(mb) => mb * self.cpus as u64 * 1_000_000,
            None => DEFAULT_RAM_LIMIT_BYTES,
        }
    }

    /// Java heap for the bbtools JVM, whole gigabytes rounded down.
    pub fn java_heap_gb(&self) -> u64 {
        self.ram_limit_bytes() / 1_000_000_000
    }
}

/// Upstream stages whose read files this driver consumes. Each tag carries
/// the directory marker its producing stage writes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Trim,
    Normalise,
}

impl Stage {
    pub fn dir_marker(self) -> &'static str {
        match self {
            Stage::Trim => "bbduk",
            Stage::Normalise => "bbnorm",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Stage::Trim => "trimming",
            Stage::Normalise => "normalization",
        }
    }
}

/// Read files for the driver, tagged by the stage that produced them. The
/// pipeline declaration fills this in directly; `resolve` recovers the
/// association from an untagged candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInputs {
    pub trimmed: PathBuf,
    pub normalised: PathBuf,
}

impl StageInputs {
    pub fn new(trimmed: PathBuf, normalised: PathBuf) -> Self {
        Self {
            trimmed,
            normalised,
        }
    }

    pub fn resolve(candidates: &[PathBuf]) -> Result<Self> {
        Ok(Self {
            trimmed: stage_input(candidates, Stage::Trim)?.clone(),
            normalised: stage_input(candidates, Stage::Normalise)?.clone(),
        })
    }

    /// The peak table lives next to the normalised reads.
    pub fn peaks_file(&self) -> PathBuf {
        self.normalised
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(PEAKS_FILENAME)
    }
}

/// Pick the candidate produced by `stage`, by its containing directory.
pub fn stage_input(candidates: &[PathBuf], stage: Stage) -> Result<&PathBuf> {
    candidates
        .iter()
        .find(|path| {
            path.parent()
                .map(|dir| dir.to_string_lossy().contains(stage.dir_marker()))
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            PipelineError::Config(format!(
                "no {} input: expected a candidate under a '{}' directory, got {:?}",
                stage.describe(),
                stage.dir_marker(),
                candidates
            ))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageThresholds {
    pub min_coverage: u64,
    pub max_coverage: u64,
}

/// Parse the peak caller's table: tab-separated rows, `#` comments. By the
/// caller's convention the depth band is row 0 column 0 through row 1
/// column 2; anything past the second row is ignored.
pub fn parse_peak_table(text: &str) -> Result<CoverageThresholds> {
    let rows: Vec<Vec<&str>> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#') && !line.trim().is_empty())
        .map(|line| line.split('\t').collect())
        .collect();

    if rows.len() < 2 {
        return Err(PipelineError::Peaks(format!(
            "expected at least 2 data rows, found {}",
            rows.len()
        )));
    }

    let min_cell = rows[0].first().ok_or_else(|| {
        PipelineError::Peaks("first data row has no columns".to_string())
    })?;
    let max_cell = rows[1].get(2).ok_or_else(|| {
        PipelineError::Peaks(format!(
            "second data row has {} columns, need at least 3",
            rows[1].len()
        ))
    })?;

    Ok(CoverageThresholds {
        min_coverage: parse_depth(min_cell)?,
        max_coverage: parse_depth(max_cell)?,
    })
}

fn parse_depth(cell: &str) -> Result<u64> {
    cell.trim().parse().map_err(|_| {
        PipelineError::Peaks(format!("'{}' is not a valid coverage depth", cell))
    })
}

pub fn read_peak_table(path: &Path) -> Result<CoverageThresholds> {
    let text = fs::read_to_string(path).map_err(|e| {
        PipelineError::Peaks(format!("cannot read '{}': {}", path.display(), e))
    })?;
    parse_peak_table(&text)
}

/// Everything the driver needs, established by the pipeline declaration.
#[derive(Debug, Clone)]
pub struct CoverageBinJob {
    pub inputs: StageInputs,
    /// Final deliverable: the in-band ("mid") read stream.
    pub output: PathBuf,
    /// Path to the bbnorm launcher script.
    pub bbnorm: PathBuf,
}

fn bbnorm_args(
    job: &CoverageBinJob,
    thresholds: CoverageThresholds,
    resources: Resources,
    scratch: &Path,
    outdir: &Path,
) -> Vec<String> {
    vec![
        format!("threads={}", resources.cpus),
        format!("-Xmx{}g", resources.java_heap_gb()),
        format!("in={}", job.inputs.trimmed.display()),
        format!("outlow={}", scratch.join("low.fq.gz").display()),
        format!("outmid={}", job.output.display()),
        format!("outhigh={}", scratch.join("high.fq.gz").display()),
        format!("hist={}", outdir.join("hist_before.txt").display()),
        format!("histout={}", outdir.join("hist_after.txt").display()),
        "passes=1".to_string(),
        format!("lowbindepth={}", thresholds.min_coverage),
        format!("highbindepth={}", thresholds.max_coverage),
        "prefilter".to_string(),
        "tossbadreads".to_string(),
    ]
}

/// Run the driver: read the peak table, size the JVM, and invoke bbnorm.
/// The low/high streams go to a scratch directory that is removed when the
/// call finishes; only the mid stream lands in the declared output.
pub async fn run(job: &CoverageBinJob, resources: Resources) -> Result<()> {
    let outdir = job
        .output
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    fs::create_dir_all(&outdir)?;

    let thresholds = read_peak_table(&job.inputs.peaks_file())?;
    log::info!(
        "bin_reads_by_coverage: lowbindepth={} highbindepth={} threads={} heap={}g",
        thresholds.min_coverage,
        thresholds.max_coverage,
        resources.cpus,
        resources.java_heap_gb()
    );

    let scratch = TempDir::new()?;
    let args = bbnorm_args(job, thresholds, resources, scratch.path(), &outdir);

    let output = TokioCommand::new(&job.bbnorm)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await?;

    fs::write(outdir.join("bbnorm.log"), &output.stdout)?;
    fs::write(outdir.join("bbnorm.err"), &output.stderr)?;

    if !output.status.success() {
        return Err(PipelineError::Task(format!(
            "bbnorm exited with {}",
            output.status
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_come_from_first_two_rows() {
        let table = "10\t500\t900\n20\t600\t1000\n30\t700\t1100\n";
        let t = parse_peak_table(table).unwrap();
        assert_eq!(t.min_coverage, 10);
        assert_eq!(t.max_coverage, 1000);
    }

    #[test]
    fn comment_lines_are_ignored() {
        let table = "#depth\tstart\tstop\n  #\n7\t8\t9\n1\t2\t3\n";
        let t = parse_peak_table(table).unwrap();
        assert_eq!(t.min_coverage, 7);
        assert_eq!(t.max_coverage, 3);
    }

    #[test]
    fn short_tables_are_descriptive_errors() {
        let err = parse_peak_table("# only comments\n").unwrap_err();
        assert!(err.to_string().contains("at least 2 data rows"));

        let err = parse_peak_table("1\t2\t3\n").unwrap_err();
        assert!(err.to_string().contains("found 1"));
    }

    #[test]
    fn short_second_row_is_an_error() {
        let err = parse_peak_table("1\t2\t3\n4\t5\n").unwrap_err();
        assert!(err.to_string().contains("need at least 3"));
    }

    #[test]
    fn non_numeric_cells_are_errors() {
        let err = parse_peak_table("depth\t2\t3\n4\t5\t6\n").unwrap_err();
        assert!(err.to_string().contains("not a valid coverage depth"));
    }

    #[test]
    fn stage_inputs_resolve_by_directory_marker() {
        let candidates = vec![
            PathBuf::from("output/bbduk/x.fastq.gz"),
            PathBuf::from("output/bbnorm/y.fastq.gz"),
        ];
        let inputs = StageInputs::resolve(&candidates).unwrap();
        assert_eq!(inputs.trimmed, PathBuf::from("output/bbduk/x.fastq.gz"));
        assert_eq!(inputs.normalised, PathBuf::from("output/bbnorm/y.fastq.gz"));
        assert_eq!(inputs.peaks_file(), PathBuf::from("output/bbnorm/peaks.txt"));
    }

    #[test]
    fn missing_stage_is_a_config_error() {
        let candidates = vec![PathBuf::from("output/bbduk/x.fastq.gz")];
        let err = StageInputs::resolve(&candidates).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("bbnorm"));
    }

    #[test]
    fn resource_defaults_without_environment() {
        let r = Resources::from_vars(None, None);
        assert_eq!(r.cpus, 1);
        assert_eq!(r.ram_limit_bytes(), 4_000_000_000);
        assert_eq!(r.java_heap_gb(), 4);
    }

    #[test]
    fn heap_is_floor_of_total_allocation() {
        let r = Resources::from_vars(Some("8"), Some("6800"));
        assert_eq!(r.cpus, 8);
        assert_eq!(r.ram_limit_bytes(), 54_400_000_000);
        assert_eq!(r.java_heap_gb(), 54);

        // 3 * 500 MB = 1.5e9 bytes, floors to 1 GB
        let r = Resources::from_vars(Some("3"), Some("500"));
        assert_eq!(r.java_heap_gb(), 1);
    }

    #[test]
    fn unparseable_environment_falls_back_to_defaults() {
        let r = Resources::from_vars(Some("8(x2)"), Some("lots"));
        assert_eq!(r, Resources::default());
    }

    #[test]
    fn bbnorm_call_keeps_only_mid_in_output_dir() {
        let job = CoverageBinJob {
            inputs: StageInputs::new(
                PathBuf::from("output/bbduk/trimmed.fastq.gz"),
                PathBuf::from("output/bbnorm/normalised.fastq.gz"),
            ),
            output: PathBuf::from("output/bin_reads_by_coverage/peak_coverage.fastq.gz"),
            bbnorm: PathBuf::from("bin/bbtools/bbnorm.sh"),
        };
        let thresholds = parse_peak_table("0\t1\t2\n3\t4\t5\n").unwrap();
        let args = bbnorm_args(
            &job,
            thresholds,
            Resources::default(),
            Path::new("/scratch/tmp123"),
            Path::new("output/bin_reads_by_coverage"),
        );

        assert!(args.contains(&"lowbindepth=0".to_string()));
        assert!(args.contains(&"highbindepth=5".to_string()));
        assert!(args.contains(&"threads=1".to_string()));
        assert!(args.contains(&"-Xmx4g".to_string()));
        assert!(args.contains(&"passes=1".to_string()));
        assert!(
            args.contains(
                &"outmid=output/bin_reads_by_coverage/peak_coverage.fastq.gz".to_string()
            )
        );

        // low and high streams stay in scratch, never the output directory
        for arg in &args {
            if let Some(path) = arg
                .strip_prefix("outlow=")
                .or_else(|| arg.strip_prefix("outhigh="))
            {
                assert!(path.starts_with("/scratch/tmp123"));
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn driver_invokes_bbnorm_and_captures_logs() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let bbduk_dir = dir.path().join("output/bbduk");
        let bbnorm_dir = dir.path().join("output/bbnorm");
        let bin_dir = dir.path().join("output/bin_reads_by_coverage");
        fs::create_dir_all(&bbduk_dir).unwrap();
        fs::create_dir_all(&bbnorm_dir).unwrap();

        let trimmed = bbduk_dir.join("trimmed.fastq.gz");
        fs::write(&trimmed, b"reads").unwrap();
        let normalised = bbnorm_dir.join("normalised.fastq.gz");
        fs::write(&normalised, b"reads").unwrap();
        fs::write(bbnorm_dir.join("peaks.txt"), "#header\n0\t1\t2\n3\t4\t5\n").unwrap();

        // fake bbnorm: record argv, touch outmid, say something on both streams
        let fake = dir.path().join("bbnorm.sh");
        let argv_log = dir.path().join("argv.txt");
        let mut script = fs::File::create(&fake).unwrap();
        writeln!(script, "#!/bin/sh").unwrap();
        writeln!(script, "printf '%s\\n' \"$@\" > '{}'", argv_log.display()).unwrap();
        writeln!(
            script,
            "for a in \"$@\"; do case \"$a\" in outmid=*) touch \"${{a#outmid=}}\";; esac; done"
        )
        .unwrap();
        writeln!(script, "echo normalising").unwrap();
        writeln!(script, "echo warnings >&2").unwrap();
        drop(script);
        let mut perms = fs::metadata(&fake).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&fake, perms).unwrap();

        let job = CoverageBinJob {
            inputs: StageInputs::new(trimmed, normalised),
            output: bin_dir.join("peak_coverage.fastq.gz"),
            bbnorm: fake,
        };

        run(&job, Resources::default()).await.unwrap();

        assert!(job.output.exists());
        let argv = fs::read_to_string(&argv_log).unwrap();
        assert!(argv.contains("lowbindepth=0"));
        assert!(argv.contains("highbindepth=5"));

        let log = fs::read_to_string(bin_dir.join("bbnorm.log")).unwrap();
        assert!(log.contains("normalising"));
        let err = fs::read_to_string(bin_dir.join("bbnorm.err")).unwrap();
        assert!(err.contains("warnings"));

        // only the mid stream lands in the task's output directory
        let names: Vec<String> = fs::read_dir(&bin_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!names.iter().any(|n| n.contains("low") || n.contains("high")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_bbnorm_is_reported() {
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let bbnorm_dir = dir.path().join("output/bbnorm");
        fs::create_dir_all(&bbnorm_dir).unwrap();
        fs::write(bbnorm_dir.join("peaks.txt"), "0\t1\t2\n3\t4\t5\n").unwrap();

        let fake = dir.path().join("bbnorm.sh");
        fs::write(&fake, "#!/bin/sh\nexit 3\n").unwrap();
        let mut perms = fs::metadata(&fake).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&fake, perms).unwrap();

        let job = CoverageBinJob {
            inputs: StageInputs::new(
                dir.path().join("output/bbduk/trimmed.fastq.gz"),
                bbnorm_dir.join("normalised.fastq.gz"),
            ),
            output: dir.path().join("output/bin_reads_by_coverage/out.fastq.gz"),
            bbnorm: fake,
        };

        let err = run(&job, Resources::default()).await.unwrap_err();
        assert!(err.to_string().contains("bbnorm exited"));
    }
}
