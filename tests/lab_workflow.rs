//! End-to-end runs against a temporary database

use remotelab::correction::{DivergenceKind, Verdict};
use remotelab::csv_io;
use remotelab::db::{Database, GroundTruthRow, PlantConfigInput};
use remotelab::grading;
use remotelab::recorder::{self, StepRecorder};
use remotelab::report;
use remotelab::CorrectionOptions;
use std::collections::HashSet;
use std::io::Cursor;

fn open_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_at(dir.path().join("data").join("remote_lab.sqlite3")).unwrap();
    (dir, db)
}

fn press(db: &Database, io_names: Option<Vec<String>>) -> i32 {
    db.create_plant_config(&PlantConfigInput {
        experiment_name: "press".to_string(),
        ip_profinet: "192.168.0.1".to_string(),
        rack_profinet: 0,
        slot_profinet: 1,
        db_number_profinet: 2,
        num_of_inputs: 2,
        num_of_outputs: 2,
        io_names,
    })
    .unwrap()
}

#[test]
fn csv_import_then_grade_approved() {
    let (_dir, db) = open_db();
    let id = press(&db, None);

    let gt_csv = "experiment_name,ground_truth\n\
                  press,\"[{\"\"pulse_value\"\": 8, \"\"duration\"\": 1.0}, {\"\"pulse_value\"\": 5, \"\"duration\"\": 2.0}]\"\n\
                  unknown,[1]\n";
    let rows = csv_io::read_ground_truth(Cursor::new(gt_csv)).unwrap();
    let allowed: HashSet<String> = ["press".to_string()].into_iter().collect();
    assert_eq!(db.import_ground_truth(&rows, &allowed).unwrap(), (1, 1));

    let collected = "Passo,Step,Valor do Passo,Duracao (s),Timestamp\n\
                     0,\"[True, False, False, False]\",8,1.1,1.0\n\
                     1,\"[False, True, False, True]\",5,2.3,2.1\n\
                     2,\"[False, False, True, True]\",3,0.4,4.4\n\
                     3,\"[True, False, False, False]\",8,0.9,4.8\n\
                     4,\"[False, True, False, True]\",5,1.8,5.7\n\
                     5,\"[False, False, False, False]\",0,,7.5\n";
    let samples = csv_io::read_collected(Cursor::new(collected)).unwrap();
    assert_eq!(db.import_collected_rows(id, "press", &samples).unwrap(), (1, 6));

    let report = grading::correct_experiment(&db, id, &CorrectionOptions::default()).unwrap();
    assert_eq!(report.verdict, Verdict::Approved);
    assert_eq!(report.occurrence_starts, vec![0, 3]);
    assert_eq!(report::render_text(&report), "yes\n\n2\n");
}

#[test]
fn rejection_explains_first_wrong_io() {
    let (_dir, db) = open_db();
    let names: Vec<String> = ["start", "sensor", "motor", "lamp"].iter().map(|s| s.to_string()).collect();
    let id = press(&db, Some(names));

    db.upsert_ground_truth("press", "[[8, 1.0], [5, 2.0], [3, 1.0]]").unwrap();

    let rows = vec![
        GroundTruthRow { experiment_name: "press".into(), ground_truth: "[[8, 1.0], [5, 2.0], [3, 1.0]]".into() },
    ];
    let allowed: HashSet<String> = ["press".to_string()].into_iter().collect();
    assert_eq!(db.import_ground_truth(&rows, &allowed).unwrap(), (1, 0));
    assert_eq!(db.list_ground_truth().unwrap().len(), 1);

    // 8, 5, then 1 (0001) where 3 (0011) was expected: motor stayed off
    let samples = csv_io::read_collected(Cursor::new(
        "Passo,Step,Valor do Passo,Duracao (s),Timestamp\n\
         0,,8,1.0,\n\
         1,,5,2.0,\n\
         2,,1,1.0,\n\
         3,,0,1.0,\n",
    ))
    .unwrap();
    db.import_collected_rows(id, "press", &samples).unwrap();

    let report = grading::correct_experiment(&db, id, &CorrectionOptions::default()).unwrap();
    assert_eq!(report.verdict, Verdict::Rejected);

    let partial = report.best_partial.as_ref().unwrap();
    assert_eq!(partial.matched, 2);
    assert_eq!(partial.divergence.kind, DivergenceKind::Value);
    assert_eq!(partial.divergence.io_diffs.len(), 1);
    assert_eq!(partial.divergence.io_diffs[0].to_string(), "motor: on → off");

    let text = report::render_text(&report);
    assert!(text.starts_with("no\n\n0\n\n"));
    assert!(text.contains("Step 3: expected 3 (0011), observed 1 (0001)"));
}

#[test]
fn recorded_session_is_stored_and_summarized() {
    let (_dir, db) = open_db();
    let id = press(&db, None);
    let config = db.get_plant_config(id).unwrap().unwrap();

    // Byte bit 0 is the first I/O: 0x01 → 1000 → 8, 0x0A → 0101 → 5
    let log = "\
0.0,0x01
1.0,0x0A
3.0,0x01
4.0,0x0A
6.0,0x00
";
    let mut rec = StepRecorder::new(id, &config.experiment_name, config.layout());
    let steps = rec.replay(Cursor::new(log)).unwrap();
    let run_id = db.next_run_id(id).unwrap();
    for step in &steps {
        db.insert_collected_row(run_id, step).unwrap();
    }
    let values: Vec<u32> = steps.iter().map(|s| s.pulse_value).collect();
    db.insert_summary(id, &recorder::summary_string(&values)).unwrap();

    assert_eq!(db.pulse_values_by_experiment(id).unwrap(), vec![8, 5, 8, 5, 0]);
    assert_eq!(db.latest_summary(id).unwrap().unwrap().pattern, "[8,5,8,5,0]");

    db.create_ground_truth("press", "[8, 5]").unwrap();
    let report = grading::correct_experiment(&db, id, &CorrectionOptions::default()).unwrap();
    assert!(report.is_approved());
    assert_eq!(report.discarded.and_then(|s| s.value), Some(0));
}

#[test]
fn importing_the_same_run_twice_still_approves() {
    let (_dir, db) = open_db();
    let id = press(&db, None);
    db.create_ground_truth("press", "[[8, 1], [4, 2], [2, 1]]").unwrap();

    let csv = "Passo,Step,Valor do Passo,Duracao (s),Timestamp\n\
               0,,8,1.0,\n\
               1,,4,2.0,\n\
               2,,2,1.0,\n\
               3,,8,1.0,\n\
               4,,4,2.0,\n\
               5,,2,1.0,\n\
               6,,0,,\n";
    let samples = csv_io::read_collected(Cursor::new(csv)).unwrap();

    for expected_run in 1..=2 {
        assert_eq!(db.import_collected_rows(id, "press", &samples).unwrap(), (expected_run, 7));
        let report = grading::correct_experiment(&db, id, &CorrectionOptions::default()).unwrap();
        assert_eq!(report.verdict, Verdict::Approved);
        assert_eq!(report.occurrences, 2);
    }
}

#[test]
fn export_round_trips_through_csv() {
    let (dir, db) = open_db();
    let id = press(&db, None);
    let samples = csv_io::read_collected(Cursor::new(
        "Passo,Step,Valor do Passo,Duracao (s),Timestamp\n0,\"[True, False, False, False]\",8,1.5,10.0\n",
    ))
    .unwrap();
    db.import_collected_rows(id, "press", &samples).unwrap();

    let path = dir.path().join("export.csv");
    let rows = db.list_collected_by_experiment(id, 100).unwrap();
    csv_io::write_collected(std::fs::File::create(&path).unwrap(), &rows).unwrap();

    let back = csv_io::read_collected_path(&path).unwrap();
    assert_eq!(back, samples);
}
