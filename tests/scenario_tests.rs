//! Every canned scenario, in both compile modes

mod common;
use common::concurrent_config;
use quicktier::scenarios::{self, Checks};
use quicktier::{CompileMode, DeoptReason, Engine, EngineConfig, Error};
use std::io::Write;

fn assert_passes(name: &str, config: EngineConfig) {
    let scenario = scenarios::find(name).unwrap();
    let report = scenario.run(config).unwrap();
    let failures: Vec<_> = report.failures().collect();
    assert!(failures.is_empty(), "{} failed:\n{}", name, report);
    assert!(!report.checks.is_empty());
}

mod synchronous {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_all_scenarios() {
        for scenario in scenarios::all() {
            assert_passes(scenario.name, EngineConfig::default());
        }
    }

    #[test]
    fn test_shape_change_deopts_once() {
        let report = scenarios::find("shape-change").unwrap().run(EngineConfig::default()).unwrap();
        assert_eq!(report.stats.deopts_for(DeoptReason::ShapeMismatch), 1);
        assert_eq!(report.stats.optimized_compiles, 2);
    }

    #[test]
    fn test_type_change_deopts_once() {
        let report = scenarios::find("type-change").unwrap().run(EngineConfig::default()).unwrap();
        assert_eq!(report.stats.deopts_for(DeoptReason::TypeMismatch), 1);
    }
}

mod concurrent {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_all_scenarios() {
        for scenario in scenarios::all() {
            assert_passes(scenario.name, concurrent_config());
        }
    }

    #[test]
    fn test_osr_with_slow_workers() {
        assert_passes("osr-sum", concurrent_config().with_recompilation_delay(20));
        assert_passes("osr-literals", concurrent_config().with_recompilation_delay(20));
    }
}

mod harness {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_drive_against_prepared_engine() {
        let scenario = scenarios::find("compare").unwrap();
        let mut engine = Engine::new(scenario.program().unwrap(), EngineConfig::default()).unwrap();
        let mut checks = Checks::default();
        scenario.drive(&mut engine, &mut checks).unwrap();
        assert!(checks.results().iter().all(|c| c.passed));
        assert_eq!(checks.results().len(), 25);
    }

    #[test]
    fn test_report_serializes() {
        let report = scenarios::find("osr-literals").unwrap().run(EngineConfig::default()).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["name"], "osr-literals");
        assert_eq!(json["checks"][0]["passed"], true);
        assert!(json["stats"]["osrTransfers"].as_u64().unwrap() >= 1);
        assert_eq!(json["functions"][0]["name"], "mod");
    }

    #[test]
    fn test_config_file_selects_mode() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"compileMode": "concurrent", "workerThreads": 2, "osrThreshold": 50}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.compile_mode, CompileMode::Concurrent);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.osr_threshold, 50);
        assert_eq!(config.optimize_threshold, EngineConfig::default().optimize_threshold);
        assert_passes("type-change", config);
    }

    #[test]
    fn test_bad_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"compileMode": "eventually"}}"#).unwrap();
        assert!(matches!(EngineConfig::from_file(file.path()), Err(Error::ConfigError(_))));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(EngineConfig::from_file(missing), Err(Error::IoError { .. })));
    }
}
