use std::{collections::HashMap, env, fs, path::PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::error::Result;

/// Pipeline configuration (`asmpipe.toml`). Paths may reference `${VAR}` /
/// `$VAR`, substituted from `ENV_*`-prefixed environment variables and `PWD`.
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    pub data: DataSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub assembly: AssemblySection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    variables: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct DataSection {
    /// Directory holding the PCR-free read libraries.
    pub pcrfree_dir: String,
    /// Directory holding the Nextera mate-pair libraries.
    pub nextera_dir: String,
    #[serde(default = "default_read_suffix")]
    pub read_suffix: String,
}

#[derive(Debug, Deserialize)]
pub struct OutputSection {
    #[serde(default = "default_output_dir")]
    pub dir: String,
}

#[derive(Debug, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_bbtools_dir")]
    pub bbtools_dir: String,
    #[serde(default = "default_script_dir")]
    pub script_dir: String,
    #[serde(default = "default_rscript_dir")]
    pub rscript_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct AssemblySection {
    #[serde(default = "default_kmer_lengths")]
    pub kmer_lengths: Vec<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunSection {
    pub workers: Option<usize>,
    pub cache_dir: Option<String>,
    pub default_timeout: Option<String>,
}

fn default_read_suffix() -> String {
    ".fastq.gz".to_string()
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_bbtools_dir() -> String {
    "bin/bbtools".to_string()
}

fn default_script_dir() -> String {
    "src/sh".to_string()
}

fn default_rscript_dir() -> String {
    "src/r".to_string()
}

fn default_kmer_lengths() -> Vec<u32> {
    vec![31, 61, 91]
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            bbtools_dir: default_bbtools_dir(),
            script_dir: default_script_dir(),
            rscript_dir: default_rscript_dir(),
        }
    }
}

impl Default for AssemblySection {
    fn default() -> Self {
        Self {
            kmer_lengths: default_kmer_lengths(),
        }
    }
}

impl PipelineConfig {
    pub fn pcrfree_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.pcrfree_dir)
    }

    pub fn nextera_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.nextera_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output.dir)
    }

    pub fn bbnorm_path(&self) -> PathBuf {
        PathBuf::from(&self.tools.bbtools_dir).join("bbnorm.sh")
    }

    pub fn script(&self, name: &str) -> PathBuf {
        PathBuf::from(&self.tools.script_dir).join(name)
    }

    pub fn rscript(&self, name: &str) -> PathBuf {
        PathBuf::from(&self.tools.rscript_dir).join(name)
    }
}

pub fn load_config(config_path: &str) -> Result<PipelineConfig> {
    let contents = fs::read_to_string(config_path)?;
    let config: PipelineConfig = toml::from_str(&contents)?;
    Ok(process_config(config))
}

fn process_config(mut config: PipelineConfig) -> PipelineConfig {
    let mut variables = std::mem::take(&mut config.variables);
    add_builtin_variables(&mut variables);

    for field in [
        &mut config.data.pcrfree_dir,
        &mut config.data.nextera_dir,
        &mut config.output.dir,
        &mut config.tools.bbtools_dir,
        &mut config.tools.script_dir,
        &mut config.tools.rscript_dir,
    ] {
        *field = substitute_variables(field, &variables);
    }

    if let Some(cache_dir) = config.run.cache_dir.take() {
        config.run.cache_dir = Some(substitute_variables(&cache_dir, &variables));
    }

    config
}

fn add_builtin_variables(variables: &mut HashMap<String, String>) {
    for (key, value) in env::vars() {
        variables.insert(format!("ENV_{}", key), value);
    }

    if let Ok(pwd) = env::current_dir() {
        variables.insert("PWD".to_string(), pwd.to_string_lossy().to_string());
    }
}

fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    let braced_regex = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    let simple_regex = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").unwrap();

    let mut result = braced_regex
        .replace_all(text, |caps: &regex::Captures| {
            let var_name = &caps[1];
            variables
                .get(var_name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string();

    result = simple_regex
        .replace_all(&result, |caps: &regex::Captures| {
            let var_name = &caps[1];
            variables
                .get(var_name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string();

    result
}
