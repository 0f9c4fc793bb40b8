use crossbeam_channel::unbounded;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Duration;
use ttyrec_retime::player::{Control, PlaybackOptions, Player};
use ttyrec_retime::Pipeline;

fn write_record(w: &mut impl Write, secs: i32, usecs: i32, payload: &[u8]) {
    w.write_all(&secs.to_le_bytes()).unwrap();
    w.write_all(&usecs.to_le_bytes()).unwrap();
    w.write_all(&(payload.len() as i32).to_le_bytes()).unwrap();
    w.write_all(payload).unwrap();
}

#[test]
fn plays_recorded_file_to_sink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.ttyrec");
    let mut w = BufWriter::new(File::create(&path).unwrap());
    write_record(&mut w, 1_360_317_600, 0, b"bash $ ");
    write_record(&mut w, 1_360_317_601, 0, b"ls\r\n");
    write_record(&mut w, 1_360_317_700, 0, b"notes.txt\r\n");
    w.flush().unwrap();
    drop(w);

    let mut pipeline = Pipeline::new();
    pipeline.read_binary(&path).unwrap().mark_input(" $ ").unwrap();

    let (_tx, rx) = unbounded();
    let options = PlaybackOptions {
        speed: 4.0,
        max_idle: Some(Duration::from_millis(20)),
        ..PlaybackOptions::default()
    };
    let mut player = Player::new(Vec::new(), rx, options).unwrap();
    let summary = player.play(&mut pipeline).unwrap();
    assert_eq!(summary.entries, 3);
    assert!(!summary.quit);
    assert_eq!(player.into_inner(), b"bash $ ls\r\nnotes.txt\r\n");

    // the pipeline is ready for another pass
    assert_eq!(pipeline.collect_entries().unwrap().len(), 3);
}

#[test]
fn quit_keeps_pipeline_replayable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quit.ttyrec");
    let mut w = BufWriter::new(File::create(&path).unwrap());
    for n in 0..5 {
        write_record(&mut w, 100 + n, 0, b"tick\n");
    }
    w.flush().unwrap();
    drop(w);

    let mut pipeline = Pipeline::new();
    pipeline.read_binary(&path).unwrap();
    let (tx, rx) = unbounded();
    tx.send(Control::Quit).unwrap();
    let mut player = Player::new(Vec::new(), rx, PlaybackOptions::default()).unwrap();
    let summary = player.play(&mut pipeline).unwrap();
    assert!(summary.quit);
    assert_eq!(summary.entries, 0);
    assert!(player.into_inner().is_empty());
    assert_eq!(pipeline.peek(2).unwrap().len(), 2);
}
