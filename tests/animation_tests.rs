//! Animation Sampling Tests
//!
//! Tests for:
//! - Animator interpolation between and exactly on keyframes
//! - Loop policies (Once, Loop, PingPong), including the loop-point interval
//! - Bind-pose fallback for unkeyed joints and empty clips
//! - AnimationPlayer clock

use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_2};
use std::sync::Arc;

use glam::{Mat4, Vec3};

use armature::animation::resolver::STATIC_CLIP_LENGTH;
use armature::animation::{
    AnimationData, AnimationPlayer, Animator, Bracket, JointDefinition, JointHierarchy, KeyFrameData, LoopMode,
    RawClip, build_hierarchy, resolve_clip,
};
use armature::assets::LoadSettings;

const EPSILON: f32 = 1e-5;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

fn approx_vec3(a: Vec3, b: Vec3) -> bool {
    (a - b).length() < EPSILON
}

fn translation(m: Mat4) -> Vec3 {
    m.w_axis.truncate()
}

/// shoulder (origin) → elbow (one unit along +X)
fn arm() -> JointHierarchy {
    build_hierarchy(vec![
        JointDefinition::new("shoulder", Mat4::IDENTITY).with_children(["elbow"]),
        JointDefinition::new("elbow", Mat4::from_translation(Vec3::X)),
    ])
    .unwrap()
}

/// Shoulder turns from 0° to 90° about Z between t = 0 and t = 1.
fn raise_clip(hierarchy: &JointHierarchy, length: Option<f32>) -> AnimationData {
    let mut raw = RawClip::new(
        "raise",
        vec![
            KeyFrameData::new(0.0).with_transform("shoulder", Mat4::IDENTITY),
            KeyFrameData::new(1.0).with_transform("shoulder", Mat4::from_rotation_z(FRAC_PI_2)),
        ],
    );
    if let Some(length) = length {
        raw = raw.with_length(length);
    }
    resolve_clip(raw, hierarchy).unwrap()
}

// ============================================================================
// Interpolation
// ============================================================================

#[test]
fn midpoint_rotates_arm_by_45_degrees() {
    let h = arm();
    let clip = raise_clip(&h, None);
    let pose = Animator::new(LoopMode::Loop).sample_pose(&clip, 0.5, &h);

    let elbow = pose.global_by_name(&h, "elbow").unwrap();
    assert!(
        approx_vec3(translation(elbow), Vec3::new(FRAC_1_SQRT_2, FRAC_1_SQRT_2, 0.0)),
        "elbow at {:?}",
        translation(elbow)
    );
}

#[test]
fn exact_keyframe_returns_authored_matrix() {
    let h = arm();
    let clip = raise_clip(&h, None);
    let shoulder = h.id("shoulder").unwrap();

    let pose = Animator::new(LoopMode::Once).sample_pose(&clip, 1.0, &h);
    assert_eq!(pose.local(shoulder), Mat4::from_rotation_z(FRAC_PI_2));

    let pose = Animator::new(LoopMode::Once).sample_pose(&clip, 0.0, &h);
    assert_eq!(pose.local(shoulder), Mat4::IDENTITY);
}

#[test]
fn unkeyed_joint_keeps_bind_pose() {
    let h = arm();
    let clip = raise_clip(&h, None);
    let elbow = h.id("elbow").unwrap();

    for t in [0.0, 0.3, 0.75] {
        let pose = Animator::default().sample_pose(&clip, t, &h);
        assert!(approx_vec3(translation(pose.local(elbow)), Vec3::X));
    }
}

#[test]
fn rotation_interpolates_along_shortest_arc() {
    let h = arm();
    // 170° to -170°: the short way passes through 180°, not 0°.
    let clip = resolve_clip(
        RawClip::new(
            "swing",
            vec![
                KeyFrameData::new(0.0).with_transform("shoulder", Mat4::from_rotation_z(170f32.to_radians())),
                KeyFrameData::new(1.0).with_transform("shoulder", Mat4::from_rotation_z(-170f32.to_radians())),
            ],
        ),
        &h,
    )
    .unwrap();

    let pose = Animator::new(LoopMode::Once).sample_pose(&clip, 0.5, &h);
    let elbow = pose.global_by_name(&h, "elbow").unwrap();
    assert!(
        (translation(elbow) - Vec3::NEG_X).length() < 1e-4,
        "elbow at {:?}",
        translation(elbow)
    );
}

#[test]
fn single_keyframe_clip_is_constant() {
    let h = arm();
    let pose_matrix = Mat4::from_rotation_z(0.3);
    let clip = resolve_clip(
        RawClip::new("idle", vec![KeyFrameData::new(0.0).with_transform("shoulder", pose_matrix)]),
        &h,
    )
    .unwrap();
    assert!(approx(clip.length_seconds, STATIC_CLIP_LENGTH));

    let animator = Animator::default();
    for t in [0.0, 0.4, 17.0, -2.0] {
        assert_eq!(animator.sample_pose(&clip, t, &h).local(h.root()), pose_matrix);
    }
}

// ============================================================================
// Loop Policies
// ============================================================================

#[test]
fn loop_mode_repeats_every_clip_length() {
    let h = arm();
    let clip = raise_clip(&h, None);
    let animator = Animator::new(LoopMode::Loop);

    for t in [0.1, 0.35, 0.8] {
        let a = animator.sample_pose(&clip, t, &h);
        let b = animator.sample_pose(&clip, t + clip.length_seconds, &h);
        let c = animator.sample_pose(&clip, t + 3.0 * clip.length_seconds, &h);
        let elbow = h.id("elbow").unwrap();
        assert!(approx_vec3(translation(a.global(elbow)), translation(b.global(elbow))));
        assert!(approx_vec3(translation(a.global(elbow)), translation(c.global(elbow))));
    }
}

#[test]
fn negative_time_wraps_in_loop_mode() {
    let h = arm();
    let clip = raise_clip(&h, None);
    let animator = Animator::new(LoopMode::Loop);
    let elbow = h.id("elbow").unwrap();

    let a = animator.sample_pose(&clip, -0.5, &h);
    let b = animator.sample_pose(&clip, 0.5, &h);
    assert!(approx_vec3(translation(a.global(elbow)), translation(b.global(elbow))));
}

#[test]
fn once_mode_clamps_to_end_keyframes() {
    let h = arm();
    let clip = raise_clip(&h, None);
    let animator = Animator::new(LoopMode::Once);

    assert_eq!(animator.bracket(&clip, -4.0), Bracket::Exact(0));
    assert_eq!(animator.bracket(&clip, 0.0), Bracket::Exact(0));
    assert_eq!(animator.bracket(&clip, clip.length_seconds), Bracket::Exact(1));
    assert_eq!(animator.bracket(&clip, 10.0), Bracket::Exact(1));
}

#[test]
fn ping_pong_plays_backwards_on_odd_passes() {
    let h = arm();
    let clip = raise_clip(&h, None);
    let animator = Animator::new(LoopMode::PingPong);
    let elbow = h.id("elbow").unwrap();

    let forward = animator.sample_pose(&clip, 0.25, &h);
    let backward = animator.sample_pose(&clip, 1.75, &h);
    assert!(approx_vec3(
        translation(forward.global(elbow)),
        translation(backward.global(elbow))
    ));
}

#[test]
fn loop_interval_blends_last_keyframe_into_first() {
    let h = arm();
    // Keys at 0 and 1, clip runs to 2: [1, 2) blends from 90° back to 0°.
    let clip = raise_clip(&h, Some(2.0));
    let elbow = h.id("elbow").unwrap();

    match Animator::new(LoopMode::Loop).bracket(&clip, 1.5) {
        Bracket::Between { prev, next, factor } => {
            assert_eq!((prev, next), (1, 0));
            assert!(approx(factor, 0.5));
        }
        other => panic!("expected a loop-point interval, got {other:?}"),
    }

    let looped = Animator::new(LoopMode::Loop).sample_pose(&clip, 1.5, &h);
    assert!(approx_vec3(
        translation(looped.global(elbow)),
        Vec3::new(FRAC_1_SQRT_2, FRAC_1_SQRT_2, 0.0)
    ));

    let clamped = Animator::new(LoopMode::Once).sample_pose(&clip, 1.5, &h);
    assert!(approx_vec3(translation(clamped.global(elbow)), Vec3::Y));
}

// ============================================================================
// Pose Composition
// ============================================================================

#[test]
fn bind_pose_composes_globals_root_first() {
    let h = build_hierarchy(vec![
        JointDefinition::new("hip", Mat4::from_translation(Vec3::Y)).with_children(["knee"]),
        JointDefinition::new("knee", Mat4::from_translation(Vec3::new(0.0, -0.5, 0.0))).with_children(["ankle"]),
        JointDefinition::new("ankle", Mat4::from_translation(Vec3::new(0.0, -0.4, 0.0))),
    ])
    .unwrap();
    let pose = armature::Pose::bind(&h);

    let ankle = pose.global_by_name(&h, "ankle").unwrap();
    assert!(approx_vec3(translation(ankle), Vec3::new(0.0, 0.1, 0.0)));
    assert_eq!(pose.globals(), h.bind_globals().as_slice());

    let named = pose.to_named_map(&h);
    assert_eq!(named.len(), 3);
    assert!(approx_vec3(translation(named["knee"]), Vec3::new(0.0, 0.5, 0.0)));
}

#[test]
fn sample_into_reuses_pose_buffer() {
    let h = arm();
    let clip = raise_clip(&h, None);
    let animator = Animator::default();

    let mut pose = armature::Pose::default();
    animator.sample_into(&clip, 0.5, &h, &mut pose);
    assert_eq!(pose.len(), 2);
    animator.sample_into(&clip, 0.25, &h, &mut pose);
    assert_eq!(pose.len(), 2);
    assert_eq!(pose, animator.sample_pose(&clip, 0.25, &h));
}

#[test]
fn empty_clip_samples_to_bind_pose() {
    let h = arm();
    let clip = AnimationData {
        name: "empty".to_string(),
        length_seconds: 1.0,
        keyframes: Vec::new(),
    };
    assert!(clip.first().is_none());
    assert!(clip.last().is_none());

    for mode in [LoopMode::Once, LoopMode::Loop, LoopMode::PingPong] {
        let pose = Animator::new(mode).sample_pose(&clip, 0.4, &h);
        assert_eq!(pose, armature::Pose::bind(&h));
    }
}

// ============================================================================
// AnimationPlayer
// ============================================================================

#[test]
fn player_advances_clock_and_samples() {
    let h = arm();
    let clip = Arc::new(raise_clip(&h, None));
    let mut player = AnimationPlayer::new(Arc::clone(&clip), LoopMode::Loop);

    player.update(0.25);
    player.update(0.25);
    assert!(approx(player.time, 0.5));

    let elbow = player.pose(&h).global_by_name(&h, "elbow").unwrap();
    assert!(approx_vec3(translation(elbow), Vec3::new(FRAC_1_SQRT_2, FRAC_1_SQRT_2, 0.0)));

    player.update(1.0);
    assert!(approx(player.time, 0.5));
}

#[test]
fn player_once_mode_finishes_at_end() {
    let h = arm();
    let clip = Arc::new(raise_clip(&h, None));
    let mut player = AnimationPlayer::new(clip, LoopMode::Once);

    player.update(0.4);
    assert!(!player.is_finished());
    player.update(5.0);
    assert!(player.is_finished());
    assert!(approx(player.time, 1.0));

    let elbow = player.pose(&h).global_by_name(&h, "elbow").unwrap();
    assert!(approx_vec3(translation(elbow), Vec3::Y));
}

#[test]
fn player_set_clip_rewinds() {
    let h = arm();
    let clip = Arc::new(raise_clip(&h, None));
    let mut player = AnimationPlayer::new(Arc::clone(&clip), LoopMode::Once);
    player.update(3.0);
    assert!(player.is_finished());

    player.set_clip(Arc::new(raise_clip(&h, Some(2.0))));
    assert!(approx(player.time, 0.0));
    assert!(!player.is_finished());
    assert!(approx(player.clip().length_seconds, 2.0));
}

#[test]
fn player_from_settings_uses_configured_loop_mode() {
    let h = arm();
    let settings = LoadSettings {
        loop_mode: LoopMode::PingPong,
        ..LoadSettings::default()
    };
    let mut player = AnimationPlayer::with_settings(Arc::new(raise_clip(&h, None)), &settings);
    assert_eq!(player.loop_mode, LoopMode::PingPong);

    player.update(1.5);
    assert!(approx(player.time, 1.5));
    let elbow = player.pose(&h).global_by_name(&h, "elbow").unwrap();
    assert!(approx_vec3(translation(elbow), Vec3::new(FRAC_1_SQRT_2, FRAC_1_SQRT_2, 0.0)));
}
