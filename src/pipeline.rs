//! Static declaration of the PCR-free assembly workflow: one task per stage,
//! wired together through the files each stage reads and writes.

use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;
use crate::coverage::{CoverageBinJob, StageInputs};
use crate::error::Result;
use crate::task::{Task, validate_tasks};
use crate::util::find_by_suffix;

struct Assembler {
    id: &'static str,
    outdir: &'static str,
    result: &'static str,
}

const ASSEMBLERS: [Assembler; 3] = [
    Assembler {
        id: "meraculous",
        outdir: "meraculous",
        result: "meraculous_final_results/final.scaffolds.fa",
    },
    Assembler {
        id: "meraculous_diploid2",
        outdir: "meraculous_diploid2",
        result: "meraculous_final_results/final.scaffolds.fa",
    },
    Assembler {
        id: "soap",
        outdir: "soap_denovo2",
        result: "assembly.scafSeq",
    },
];

/// Discover the raw read sets and declare the full task graph.
pub fn build(config: &PipelineConfig) -> Result<Vec<Task>> {
    let suffix = &config.data.read_suffix;
    let pcrfree_reads = find_by_suffix(&config.pcrfree_dir(), suffix)?;
    let nextera_reads = find_by_suffix(&config.nextera_dir(), suffix)?;

    if pcrfree_reads.is_empty() {
        log::warn!(
            "No '{}' files under '{}'",
            suffix,
            config.pcrfree_dir().display()
        );
    }
    if nextera_reads.is_empty() {
        log::warn!(
            "No '{}' files under '{}'",
            suffix,
            config.nextera_dir().display()
        );
    }

    let out = config.output_dir();
    let trimmed = out.join("bbduk/filtered_trimmed.fastq.gz");
    let lmp = out.join("long_mate_pairs/lmp.fastq.gz");
    let normalised = out.join("bbnorm/normalised.fastq.gz");
    let peaks = out.join("bbnorm/peaks.txt");
    let binned = out.join("bin_reads_by_coverage/peak_coverage.fastq.gz");

    let mut tasks = Vec::new();

    // trim and decontaminate the PCR-free libraries
    tasks.push(
        Task::exec(
            "bbduk",
            script_cmd(&config.script("bbduk"), &[], &pcrfree_reads, &[trimmed.clone()]),
        )
        .consumes(pcrfree_reads.clone())
        .produces([trimmed.clone()])
        .hints(8, Some(6800)),
    );

    // trim and split the Nextera libraries into long mate pairs
    tasks.push(
        Task::exec(
            "long_mate_pairs",
            script_cmd(
                &config.script("long_mate_pairs"),
                &[],
                &nextera_reads,
                &[lmp.clone()],
            ),
        )
        .consumes(nextera_reads)
        .produces([lmp.clone()])
        .hints(8, Some(6800)),
    );

    // k-mer analysis
    let kmergenie_report = out.join("kmergenie/histogram_report.html");
    tasks.push(
        Task::exec(
            "kmergenie",
            script_cmd(
                &config.script("kmergenie"),
                &[],
                std::slice::from_ref(&trimmed),
                &[kmergenie_report.clone()],
            ),
        )
        .after(&["bbduk"])
        .consumes([trimmed.clone()])
        .produces([kmergenie_report])
        .hints(8, None),
    );

    // uniqueness histogram and its plot
    let uniqueness = out.join("bbduk/uniqueness_histogram.txt");
    tasks.push(
        Task::exec(
            "bbcountunique",
            script_cmd(
                &config.script("bbcountunique"),
                &[],
                std::slice::from_ref(&trimmed),
                &[uniqueness.clone()],
            ),
        )
        .after(&["bbduk"])
        .consumes([trimmed.clone()])
        .produces([uniqueness.clone()])
        .hints(8, Some(6800)),
    );

    let uniqueness_plot = out.join("bbduk/uniqueness_histogram.pdf");
    tasks.push(
        Task::exec(
            "plot_uniqueness_histogram",
            script_cmd(
                &config.rscript("plot_uniqueness_histogram.R"),
                &[],
                std::slice::from_ref(&uniqueness),
                &[uniqueness_plot.clone()],
            ),
        )
        .after(&["bbcountunique"])
        .consumes([uniqueness])
        .produces([uniqueness_plot]),
    );

    // read quality plot
    let quality_plot = out.join("bbduk/quality_histogram_plot.pdf");
    tasks.push(
        Task::exec(
            "plot_quality_histogram",
            script_cmd(
                &config.rscript("plot_quality_histogram.R"),
                &[],
                std::slice::from_ref(&trimmed),
                &[quality_plot.clone()],
            ),
        )
        .after(&["bbduk"])
        .consumes([trimmed.clone()])
        .produces([quality_plot]),
    );

    // normalise for the k-mer plots; also writes the peak table
    tasks.push(
        Task::exec(
            "bbnorm",
            script_cmd(
                &config.script("bbnorm"),
                &[],
                std::slice::from_ref(&trimmed),
                &[normalised.clone(), peaks.clone()],
            ),
        )
        .after(&["bbduk"])
        .consumes([trimmed.clone()])
        .produces([normalised.clone(), peaks.clone()])
        .hints(8, Some(6800)),
    );

    let kmer_plot = out.join("bbnorm/kmer_distribution_plot.pdf");
    tasks.push(
        Task::exec(
            "plot_kmer_distribution",
            script_cmd(
                &config.rscript("plot_kmer_distribution.R"),
                &[],
                std::slice::from_ref(&normalised),
                &[kmer_plot.clone()],
            ),
        )
        .after(&["bbnorm"])
        .consumes([normalised.clone()])
        .produces([kmer_plot]),
    );

    // split into coverage bins; the declaration tags which upstream file is
    // which, the driver never re-derives it
    tasks.push(
        Task::coverage_bin(
            "bin_reads_by_coverage",
            CoverageBinJob {
                inputs: StageInputs::new(trimmed.clone(), normalised.clone()),
                output: binned.clone(),
                bbnorm: config.bbnorm_path(),
            },
        )
        .after(&["bbduk", "bbnorm"])
        .consumes([trimmed.clone(), normalised, peaks])
        .produces([binned.clone()])
        .hints(8, Some(6800)),
    );

    // assemblies, subdivided per read source and per k-mer length
    let sources = [("trimmed", &trimmed, "bbduk"), ("binned", &binned, "bin_reads_by_coverage")];
    let mut scaffold_files = Vec::new();
    let mut assembler_ids = Vec::new();

    for assembler in &ASSEMBLERS {
        for &(source_name, source_path, source_task) in &sources {
            for &k in &config.assembly.kmer_lengths {
                let id = format!("{}_{}_{}mer", assembler.id, source_name, k);
                let scaffolds = out
                    .join(assembler.outdir)
                    .join(source_name)
                    .join(format!("run_{}mer", k))
                    .join(assembler.result);

                tasks.push(
                    Task::exec(
                        id.clone(),
                        script_cmd(
                            &config.script(assembler.id),
                            &["-k".to_string(), k.to_string()],
                            &[source_path.clone(), lmp.clone()],
                            &[scaffolds.clone()],
                        ),
                    )
                    .after(&[source_task, "long_mate_pairs"])
                    .consumes([source_path.clone(), lmp.clone()])
                    .produces([scaffolds.clone()])
                    .hints(8, Some(6800)),
                );

                scaffold_files.push(scaffolds);
                assembler_ids.push(id);
            }
        }
    }

    // merge assembler outputs into one statistics report
    let statistics = out.join("assembly_statistics/statistics.txt");
    let assembler_deps: Vec<&str> = assembler_ids.iter().map(String::as_str).collect();
    tasks.push(
        Task::exec(
            "assembly_statistics",
            script_cmd(
                &config.script("assembly_statistics"),
                &[],
                &scaffold_files,
                &[statistics.clone()],
            ),
        )
        .after(&assembler_deps)
        .consumes(scaffold_files)
        .produces([statistics]),
    );

    validate_tasks(&tasks)?;
    Ok(tasks)
}

/// Command line for an external stage script: `-i` per input, `-o` per
/// output, extra flags first.
fn script_cmd(script: &Path, extra: &[String], inputs: &[PathBuf], outputs: &[PathBuf]) -> String {
    let mut cmd = quote(&script.to_string_lossy());

    for arg in extra {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    for input in inputs {
        cmd.push_str(" -i ");
        cmd.push_str(&quote(&input.to_string_lossy()));
    }
    for output in outputs {
        cmd.push_str(" -o ");
        cmd.push_str(&quote(&output.to_string_lossy()));
    }

    cmd
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use crate::coverage::{Stage, StageInputs, stage_input};
    use crate::task::{TaskAction, sort_topologically};
    use std::fs;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> PipelineConfig {
        let pcrfree = dir.path().join("data/pcrfree");
        let nextera = dir.path().join("data/nextera");
        fs::create_dir_all(&pcrfree).unwrap();
        fs::create_dir_all(&nextera).unwrap();
        fs::write(pcrfree.join("lib1.fastq.gz"), b"x").unwrap();
        fs::write(pcrfree.join("lib2.fastq.gz"), b"x").unwrap();
        fs::write(nextera.join("mp1.fastq.gz"), b"x").unwrap();

        let config_path = dir.path().join("asmpipe.toml");
        fs::write(
            &config_path,
            format!(
                "[data]\npcrfree_dir = \"{}\"\nnextera_dir = \"{}\"\n\n[output]\ndir = \"{}\"\n",
                pcrfree.display(),
                nextera.display(),
                dir.path().join("output").display()
            ),
        )
        .unwrap();

        load_config(config_path.to_str().unwrap()).unwrap()
    }

    fn find<'a>(tasks: &'a [Task], id: &str) -> &'a Task {
        tasks.iter().find(|t| t.id == id).unwrap()
    }

    #[test]
    fn declares_every_stage() {
        let dir = TempDir::new().unwrap();
        let tasks = build(&test_config(&dir)).unwrap();

        // 9 named stages + 3 assemblers * 2 sources * 3 k-mer lengths + stats
        assert_eq!(tasks.len(), 28);
        for id in [
            "bbduk",
            "long_mate_pairs",
            "kmergenie",
            "bbcountunique",
            "plot_uniqueness_histogram",
            "plot_quality_histogram",
            "bbnorm",
            "plot_kmer_distribution",
            "bin_reads_by_coverage",
            "meraculous_trimmed_31mer",
            "meraculous_diploid2_binned_61mer",
            "soap_binned_91mer",
            "assembly_statistics",
        ] {
            assert!(tasks.iter().any(|t| t.id == id), "missing task {}", id);
        }
    }

    #[test]
    fn bbduk_consumes_discovered_reads() {
        let dir = TempDir::new().unwrap();
        let tasks = build(&test_config(&dir)).unwrap();
        let bbduk = find(&tasks, "bbduk");
        assert_eq!(bbduk.inputs.len(), 2);
        assert_eq!(bbduk.hints.cpus, 8);
        assert_eq!(bbduk.hints.mem_per_cpu_mb, Some(6800));
    }

    #[test]
    fn coverage_bin_task_is_tagged_by_declaration() {
        let dir = TempDir::new().unwrap();
        let tasks = build(&test_config(&dir)).unwrap();
        let bin_task = find(&tasks, "bin_reads_by_coverage");

        let TaskAction::BinReadsByCoverage(job) = &bin_task.action else {
            panic!("bin_reads_by_coverage should use the builtin driver");
        };
        assert!(job.inputs.trimmed.parent().unwrap().ends_with("bbduk"));
        assert!(job.inputs.normalised.parent().unwrap().ends_with("bbnorm"));
        assert!(job.inputs.peaks_file().ends_with("bbnorm/peaks.txt"));
        assert!(bin_task.inputs.contains(&job.inputs.peaks_file()));

        // the declared tags agree with the directory-marker convention
        assert_eq!(
            stage_input(&bin_task.inputs, Stage::Trim).unwrap(),
            &job.inputs.trimmed
        );
        assert_eq!(
            StageInputs::resolve(&bin_task.inputs).unwrap(),
            job.inputs
        );
    }

    #[test]
    fn statistics_merges_all_assemblies() {
        let dir = TempDir::new().unwrap();
        let tasks = build(&test_config(&dir)).unwrap();
        let stats = find(&tasks, "assembly_statistics");
        assert_eq!(stats.dependencies.len(), 18);
        assert_eq!(stats.inputs.len(), 18);
    }

    #[test]
    fn graph_orders_trimming_before_assembly() {
        let dir = TempDir::new().unwrap();
        let tasks = build(&test_config(&dir)).unwrap();
        let order = sort_topologically(&tasks);
        assert_eq!(order.len(), tasks.len());

        let pos = |id: &str| order.iter().position(|t| t == id).unwrap();
        assert!(pos("bbduk") < pos("bbnorm"));
        assert!(pos("bbnorm") < pos("bin_reads_by_coverage"));
        assert!(pos("bin_reads_by_coverage") < pos("soap_binned_31mer"));
        assert!(pos("soap_binned_31mer") < pos("assembly_statistics"));
    }

    #[test]
    fn script_commands_quote_paths() {
        let cmd = script_cmd(
            Path::new("src/sh/bbduk"),
            &[],
            &[PathBuf::from("data/my reads.fastq.gz")],
            &[PathBuf::from("output/bbduk/trimmed.fastq.gz")],
        );
        assert_eq!(
            cmd,
            "'src/sh/bbduk' -i 'data/my reads.fastq.gz' -o 'output/bbduk/trimmed.fastq.gz'"
        );
    }
}
