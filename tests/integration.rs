use std::{fs, path::PathBuf, process::Command};

#[test]
fn basic_workflow() {
    let test_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("basic_workflow");

    fs::remove_dir_all(&test_dir).ok();
    fs::create_dir(&test_dir).expect("failed to create test directory");

    let config_path = test_dir.join("config.toml");
    let config_contents = String::new()
        + "[model]\n"
        + "num_patients = 12\n"
        + "max_group_size = 4\n"
        + "tests_per_cycle = 6\n"
        + "max_cycles = 12\n"
        + "prior_infection_rate = 0.1\n"
        + "sensitivity = [0.99, 0.97, 0.95, 0.93]\n"
        + "specificity = 0.98\n"
        + "\n"
        + "[policy]\n"
        + "sampler = \"exhaustive\"\n"
        + "\n"
        + "[[policy.stages]]\n"
        + "kind = \"informative_dorfman\"\n"
        + "cut_off_low = 0.02\n"
        + "cut_off_high = 0.98\n"
        + "\n"
        + "[[policy.stages]]\n"
        + "kind = \"split_positive\"\n"
        + "\n"
        + "[output]\n"
        + "cycles_per_file = 6\n";

    fs::write(&config_path, config_contents).expect("failed to write config file");

    fn run_bin(args: &[&str]) {
        let bin = PathBuf::from(env!("CARGO_BIN_EXE_pooltest"));

        let output = Command::new(bin)
            .args(args)
            .output()
            .expect("failed to execute command");

        let stdout_str =
            std::str::from_utf8(&output.stdout).expect("failed to convert stdout to string");
        let stderr_str =
            std::str::from_utf8(&output.stderr).expect("failed to convert stderr to string");

        assert!(
            output.status.success(),
            "failed to run binary with {args:?}\nstdout:\n{stdout_str}\nstderr:\n{stderr_str}\n"
        );
    }

    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");

    run_bin(&["--sim-dir", test_dir_str, "create"]);
    run_bin(&["--sim-dir", test_dir_str, "create"]);

    run_bin(&["--sim-dir", test_dir_str, "resume", "--run-idx", "0"]);
    run_bin(&["--sim-dir", test_dir_str, "resume", "--run-idx", "0"]);

    run_bin(&["--sim-dir", test_dir_str, "resume", "--run-idx", "1"]);
    run_bin(&["--sim-dir", test_dir_str, "resume", "--run-idx", "1"]);

    run_bin(&["--sim-dir", test_dir_str, "analyze"]);

    let results = test_dir.join("run-0000").join("results.json");
    assert!(results.is_file(), "missing {results:?}");

    run_bin(&["--sim-dir", test_dir_str, "clean"]);

    fs::remove_dir_all(&test_dir).ok();
}
