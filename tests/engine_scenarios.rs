//! End-to-end race scenarios against the session engine.

use botrally_server::bot_manager::BotManager;
use botrally_server::config::ServerConfig;
use botrally_server::data::{PlayerInput, RaceStatus};
use botrally_server::game_session::GameSession;
use botrally_server::physics::Vec2;
use botrally_server::track::{straight_track, Track};
use std::sync::Arc;

const CAR_RADIUS: f64 = 10.0;

fn session_on(track: Track) -> GameSession {
    let config = ServerConfig::default();
    let bot_manager = BotManager::new(&config).unwrap();
    GameSession::new(Arc::new(track), &config, bot_manager)
}

fn accelerate() -> PlayerInput {
    PlayerInput {
        accelerate: true,
        ..Default::default()
    }
}

/// Drive a session through its countdown into Racing.
fn into_racing(session: &mut GameSession) {
    session.start_race();
    for _ in 0..400 {
        session.step();
        if session.race_info.status == RaceStatus::Racing {
            return;
        }
    }
    panic!("countdown never finished");
}

#[test]
fn straight_sprint_single_car() {
    // One straight 500-unit stage with a mid checkpoint and the finish.
    let mut session = session_on(straight_track(500.0, 100.0, &[250.0, 500.0]));
    session.add_player("p1").unwrap();
    into_racing(&mut session);
    session.update_input("p1", accelerate());

    let mut seen_first_gate = false;
    for _ in 0..5000 {
        session.step();
        let player = &session.players["p1"];
        if player.current_checkpoint == 1 {
            seen_first_gate = true;
        }
        if player.is_finished {
            break;
        }
    }

    let player = &session.players["p1"];
    assert!(seen_first_gate, "intermediate checkpoint never registered");
    assert!(player.is_finished);
    assert_eq!(player.current_checkpoint, 2);
    assert_eq!(player.checkpoints_passed.len(), 2);
    assert_eq!(player.split_times.len(), 2);
    assert!(player.split_times[1] > player.split_times[0]);
    assert_eq!(player.position, Some(1));
    assert_eq!(player.points, 25);
    assert_eq!(session.race_info.status, RaceStatus::Finished);
}

#[test]
fn reverse_checkpoint_crossing_is_rejected() {
    let mut session = session_on(straight_track(500.0, 100.0, &[250.0, 500.0]));
    session.add_player("p1").unwrap();
    into_racing(&mut session);

    // Start just past the gate, rolling backwards through it.
    {
        let player = session.players.get_mut("p1").unwrap();
        player.car.position = Vec2::new(260.0, 0.0);
        player.prev_position = player.car.position;
        player.car.velocity = Vec2::new(-50.0, 0.0);
    }

    for _ in 0..120 {
        session.step();
    }

    let player = &session.players["p1"];
    assert_eq!(player.current_checkpoint, 0);
    assert!(player.checkpoints_passed.is_empty());
}

#[test]
fn head_on_collision_is_elastic_and_separating() {
    let mut session = session_on(straight_track(2000.0, 400.0, &[2000.0]));
    session.add_player("p1").unwrap();
    session.add_player("p2").unwrap();
    into_racing(&mut session);

    {
        let p1 = session.players.get_mut("p1").unwrap();
        p1.car.position = Vec2::new(100.0, 0.0);
        p1.car.velocity = Vec2::new(50.0, 0.0);
    }
    {
        let p2 = session.players.get_mut("p2").unwrap();
        p2.car.position = Vec2::new(115.0, 0.0);
        p2.car.velocity = Vec2::new(-50.0, 0.0);
    }

    let momentum_before: f64 = session
        .players
        .values()
        .map(|p| p.weight * p.car.velocity.x)
        .sum();

    session.step();

    let momentum_after: f64 = session
        .players
        .values()
        .map(|p| p.weight * p.car.velocity.x)
        .sum();

    let scale = momentum_before.abs().max(1.0);
    assert!(
        (momentum_before - momentum_after).abs() / scale < 1e-6,
        "momentum drifted: {momentum_before} -> {momentum_after}"
    );

    let p1 = &session.players["p1"];
    let p2 = &session.players["p2"];
    assert!(p1.car.velocity.x < 50.0);
    assert!(p2.car.velocity.x > -50.0);
    let gap = p1.car.position.distance_to(p2.car.position);
    assert!(gap >= 2.0 * CAR_RADIUS - 0.5, "cars still overlapping: {gap}");
}

#[test]
fn cars_stay_separated_while_racing_through_each_other() {
    let mut session = session_on(straight_track(2000.0, 400.0, &[2000.0]));
    session.add_player("p1").unwrap();
    session.add_player("p2").unwrap();
    into_racing(&mut session);

    // p2 sits just ahead on the line while p1 drives straight through.
    session.players.get_mut("p2").unwrap().car.position = Vec2::new(60.0, 0.0);
    session.update_input("p1", accelerate());

    for _ in 0..600 {
        session.step();
        let d = session.players["p1"]
            .car
            .position
            .distance_to(session.players["p2"].car.position);
        assert!(d >= 2.0 * CAR_RADIUS - 0.5, "overlap during tick: {d}");
    }
}

#[test]
fn grace_period_dnf_and_points() {
    let mut session = session_on(straight_track(500.0, 100.0, &[250.0, 500.0]));
    session.add_player("a").unwrap();
    session.add_player("b").unwrap();
    into_racing(&mut session);
    session.set_grace_period(2.0);

    // A sprints; B never moves.
    session.update_input("a", accelerate());

    for _ in 0..5000 {
        session.step();
        if session.players["a"].is_finished {
            break;
        }
    }
    assert!(session.players["a"].is_finished);
    assert!(session.race_info.first_finisher_time.is_some());
    assert_eq!(session.race_info.status, RaceStatus::Racing);

    // Two seconds of grace at 60 Hz.
    for _ in 0..125 {
        session.step();
    }

    assert_eq!(session.race_info.status, RaceStatus::Finished);
    let a = &session.players["a"];
    let b = &session.players["b"];
    assert_eq!(a.position, Some(1));
    assert_eq!(a.points, 25);
    assert!(b.dnf);
    assert_eq!(b.position, None);
    assert_eq!(b.points, 0);
}

#[test]
fn restart_returns_everyone_to_the_grid() {
    let mut session = session_on(straight_track(500.0, 100.0, &[250.0, 500.0]));
    session.add_player("p1").unwrap();
    into_racing(&mut session);
    session.update_input("p1", accelerate());

    for _ in 0..5000 {
        session.step();
        if session.race_info.status == RaceStatus::Finished {
            break;
        }
    }
    assert_eq!(session.race_info.status, RaceStatus::Finished);

    assert!(session.start_race());
    let player = &session.players["p1"];
    assert_eq!(player.car.position, Vec2::ZERO);
    assert_eq!(player.car.velocity, Vec2::ZERO);
    assert_eq!(player.car.nitro_charges, 2);
    assert_eq!(player.current_checkpoint, 0);
    assert!(player.checkpoints_passed.is_empty());
    assert!(player.split_times.is_empty());
    assert!(!player.is_finished);
    assert_eq!(session.race_info.status, RaceStatus::Countdown);
}

#[test]
fn snapshot_reflects_session_state() {
    let mut session = session_on(straight_track(500.0, 100.0, &[250.0, 500.0]));
    session.add_player("p1").unwrap();
    into_racing(&mut session);
    session.update_input("p1", accelerate());
    for _ in 0..120 {
        session.step();
    }

    let snapshot = session.snapshot();
    assert_eq!(snapshot.tick, session.tick);
    assert_eq!(snapshot.race_info.status, RaceStatus::Racing);
    let p1 = &snapshot.players["p1"];
    assert!(p1.car.position.x > 0.0);
    assert!(!p1.is_bot);

    // Snapshots serialize to the documented wire shape.
    let value: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();
    assert_eq!(value["race_info"]["status"], "racing");
    assert!(value["players"]["p1"]["car"]["position"]["x"].as_f64().unwrap() > 0.0);
}

#[test]
fn nitro_boosts_top_speed_and_depletes() {
    let mut session = session_on(straight_track(20000.0, 400.0, &[20000.0]));
    session.add_player("p1").unwrap();
    into_racing(&mut session);

    session.update_input(
        "p1",
        PlayerInput {
            accelerate: true,
            nitro: true,
            ..Default::default()
        },
    );

    let mut top_speed = 0.0f64;
    for _ in 0..1200 {
        session.step();
        top_speed = top_speed.max(session.players["p1"].car.speed());
    }

    // Beyond the plain cap of 150 while boosting.
    assert!(top_speed > 150.0 + 1.0, "nitro never engaged: {top_speed}");
    let car = &session.players["p1"].car;
    assert!(car.nitro_charges < 2);
}
