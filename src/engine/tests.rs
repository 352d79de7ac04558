use super::*;
use crate::authz::Actor;

const T0: Ms = 1_736_517_600_000; // 2025-01-10T14:00:00Z
const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("careslot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn roles(list: &[Role]) -> RoleSet {
    list.iter().copied().collect()
}

fn as_actor(id: Ulid, list: &[Role]) -> Actor {
    Actor::new(id, roles(list))
}

/// A tenant with one professional and one patient already enrolled.
struct Clinic {
    engine: Engine,
    admin: Actor,
    pro: Ulid,
    patient: Ulid,
}

impl Clinic {
    async fn open(name: &str) -> Self {
        let engine = Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap();
        Self::enroll(engine).await
    }

    async fn enroll(engine: Engine) -> Self {
        let admin = Actor::system();
        let pro = Ulid::new();
        let patient = Ulid::new();
        engine
            .register_account(&admin, pro, Some("Dr. Lima".into()), roles(&[Role::Professional]))
            .await
            .unwrap();
        engine
            .register_account(&admin, patient, Some("Ana".into()), roles(&[Role::Patient]))
            .await
            .unwrap();
        Self { engine, admin, pro, patient }
    }

    fn pro_actor(&self) -> Actor {
        as_actor(self.pro, &[Role::Professional])
    }

    fn patient_actor(&self) -> Actor {
        as_actor(self.patient, &[Role::Patient])
    }

    async fn publish(&self, windows: Vec<NewWindow>) -> Result<Vec<AvailabilityWindow>, EngineError> {
        self.engine
            .create_availability_batch(&self.pro_actor(), self.pro, windows)
            .await
    }

    async fn intake(&self) -> PendingAttendance {
        self.engine
            .open_attendance(&self.admin, Ulid::new(), self.patient, None, Some("first visit".into()))
            .await
            .unwrap()
    }

    async fn windows(&self) -> Vec<AvailabilityWindow> {
        let filter = AvailabilityFilter {
            professional_id: Some(self.pro),
            ..Default::default()
        };
        self.engine.list_availability(&self.admin, &filter).await.unwrap()
    }
}

// ── Availability registry ────────────────────────────────

#[tokio::test]
async fn batch_creates_all_windows_in_start_order() {
    let c = Clinic::open("batch_create.wal").await;
    let created = c
        .publish(vec![
            NewWindow::new(T0 + 2 * H, T0 + 3 * H),
            NewWindow::new(T0, T0 + H),
        ])
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|w| !w.is_booked && w.professional_id == c.pro));

    let starts: Vec<Ms> = c.windows().await.iter().map(|w| w.span.start).collect();
    assert_eq!(starts, vec![T0, T0 + 2 * H]);
}

#[tokio::test]
async fn overlap_rejected_touching_accepted() {
    let c = Clinic::open("overlap_touching.wal").await;
    let first = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap();

    let err = c
        .publish(vec![NewWindow::new(T0 + 30 * M, T0 + 90 * M)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(matches!(err, EngineError::Overlap(id) if id == first[0].id));

    c.publish(vec![NewWindow::new(T0 + H, T0 + 2 * H)]).await.unwrap();
    assert_eq!(c.windows().await.len(), 2);
}

#[tokio::test]
async fn batch_is_atomic_when_a_later_entry_conflicts() {
    let c = Clinic::open("batch_atomic.wal").await;
    c.publish(vec![NewWindow::new(T0 + 4 * H, T0 + 5 * H)]).await.unwrap();

    let err = c
        .publish(vec![
            NewWindow::new(T0, T0 + H),
            NewWindow::new(T0 + H, T0 + 2 * H),
            NewWindow::new(T0 + 4 * H + 30 * M, T0 + 6 * H),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Overlap(_)));
    assert_eq!(c.windows().await.len(), 1);
}

#[tokio::test]
async fn batch_rejects_malformed_entry_and_inner_overlap() {
    let c = Clinic::open("batch_malformed.wal").await;

    let err = c
        .publish(vec![NewWindow::new(T0, T0 + H), NewWindow::new(T0 + 3 * H, T0 + 2 * H)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(matches!(err, EngineError::InvalidWindow { index: 1, .. }));

    let err = c
        .publish(vec![NewWindow::new(T0, T0 + H), NewWindow::new(T0 + 30 * M, T0 + 2 * H)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OverlappingBatch { first: 0, second: 1 }));

    assert!(c.windows().await.is_empty());
}

#[tokio::test]
async fn window_ids_are_unique_across_professionals() {
    let c = Clinic::open("window_id_unique.wal").await;
    let other = Ulid::new();
    c.engine
        .register_account(&c.admin, other, None, roles(&[Role::Professional]))
        .await
        .unwrap();

    let created = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap();
    let reused = NewWindow {
        id: created[0].id,
        start: T0 + 5 * H,
        end: T0 + 6 * H,
    };
    let err = c
        .engine
        .create_availability_batch(&c.admin, other, vec![reused])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == created[0].id));
}

#[tokio::test]
async fn only_professionals_may_own_windows() {
    let c = Clinic::open("owner_eligibility.wal").await;

    let err = c
        .engine
        .create_availability_batch(&c.admin, c.patient, vec![NewWindow::new(T0, T0 + H)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotEligible(id) if id == c.patient));

    let stranger = Ulid::new();
    let err = c
        .engine
        .create_availability_batch(&c.admin, stranger, vec![NewWindow::new(T0, T0 + H)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == stranger));
}

#[tokio::test]
async fn professional_cannot_publish_for_a_colleague() {
    let c = Clinic::open("publish_for_colleague.wal").await;
    let colleague = Ulid::new();
    c.engine
        .register_account(&c.admin, colleague, None, roles(&[Role::Professional]))
        .await
        .unwrap();

    let err = c
        .engine
        .create_availability_batch(&c.pro_actor(), colleague, vec![NewWindow::new(T0, T0 + H)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn delete_unbooked_then_missing() {
    let c = Clinic::open("delete_unbooked.wal").await;
    let created = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap();
    let wid = created[0].id;

    let removed = c.engine.delete_availability(&c.pro_actor(), wid).await.unwrap();
    assert_eq!(removed.id, wid);
    assert!(c.windows().await.is_empty());
    assert!(c.engine.window_professional(&wid).is_none());

    let err = c.engine.delete_availability(&c.pro_actor(), wid).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    // The start instant is free again.
    c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap();
}

#[tokio::test]
async fn list_availability_filters() {
    let c = Clinic::open("list_filters.wal").await;
    c.publish(vec![
        NewWindow::new(T0, T0 + H),
        NewWindow::new(T0 + 2 * H, T0 + 3 * H),
        NewWindow::new(T0 + 5 * H, T0 + 6 * H),
    ])
    .await
    .unwrap();

    let filter = AvailabilityFilter {
        from: Some(T0 + H),
        until: Some(T0 + 6 * H),
        ..Default::default()
    };
    let found = c.engine.list_availability(&c.patient_actor(), &filter).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].span.start, T0 + 2 * H);

    let nobody = as_actor(Ulid::new(), &[]);
    let err = c.engine.list_availability(&nobody, &filter).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden));
}

// ── Attendance reservation ───────────────────────────────

#[tokio::test]
async fn reserve_schedules_attendance_and_books_window() {
    let c = Clinic::open("reserve_ok.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let att = c.intake().await;
    assert!(!att.is_scheduled());

    let reserved = c
        .engine
        .reserve_availability(&c.patient_actor(), att.id, wid)
        .await
        .unwrap();
    assert_eq!(reserved.availability_id, Some(wid));
    assert_eq!(reserved.date_at, Some(T0));
    assert_eq!(reserved.professional_id, Some(c.pro));

    let windows = c.windows().await;
    assert!(windows[0].is_booked);
}

#[tokio::test]
async fn second_reservation_leaves_state_unchanged() {
    let c = Clinic::open("reserve_twice.wal").await;
    let created = c
        .publish(vec![NewWindow::new(T0, T0 + H), NewWindow::new(T0 + H, T0 + 2 * H)])
        .await
        .unwrap();
    let att = c.intake().await;
    c.engine
        .reserve_availability(&c.admin, att.id, created[0].id)
        .await
        .unwrap();

    let err = c
        .engine
        .reserve_availability(&c.admin, att.id, created[1].id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyScheduled(id) if id == att.id));

    let after = c.engine.attendance(&c.admin, att.id).await.unwrap();
    assert_eq!(after.availability_id, Some(created[0].id));
    assert_eq!(after.date_at, Some(T0));
    let windows = c.windows().await;
    assert!(windows[0].is_booked);
    assert!(!windows[1].is_booked);
}

#[tokio::test]
async fn booked_window_refuses_another_attendance() {
    let c = Clinic::open("reserve_booked.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let first = c.intake().await;
    let second = c.intake().await;

    c.engine.reserve_availability(&c.admin, first.id, wid).await.unwrap();
    let err = c
        .engine
        .reserve_availability(&c.admin, second.id, wid)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyBooked(id) if id == wid));

    let second = c.engine.attendance(&c.admin, second.id).await.unwrap();
    assert!(!second.is_scheduled());
}

#[tokio::test]
async fn concurrent_reservations_have_one_winner() {
    let c = Clinic::open("reserve_race.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let a = c.intake().await;
    let b = c.intake().await;
    let admin = c.admin.clone();
    let engine = Arc::new(c.engine);

    let mut handles = Vec::new();
    for att_id in [a.id, b.id] {
        let engine = engine.clone();
        let admin = admin.clone();
        handles.push(tokio::spawn(async move {
            engine.reserve_availability(&admin, att_id, wid).await
        }));
    }

    let mut wins = 0;
    let mut booked = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(att) => {
                assert_eq!(att.availability_id, Some(wid));
                wins += 1;
            }
            Err(EngineError::AlreadyBooked(id)) => {
                assert_eq!(id, wid);
                booked += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((wins, booked), (1, 1));

    let scheduled = engine
        .list_attendances(
            &admin,
            &AttendanceFilter {
                scheduled: Some(true),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(scheduled.len(), 1);
}

#[tokio::test]
async fn reserve_and_delete_race_has_one_outcome() {
    let c = Clinic::open("reserve_delete_race.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let att = c.intake().await;
    let admin = c.admin.clone();
    let pro = c.pro_actor();
    let engine = Arc::new(c.engine);

    let reserve = {
        let engine = engine.clone();
        let admin = admin.clone();
        tokio::spawn(async move { engine.reserve_availability(&admin, att.id, wid).await })
    };
    let delete = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete_availability(&pro, wid).await })
    };
    let reserved = reserve.await.unwrap();
    let deleted = delete.await.unwrap();

    let current = engine.attendance(&admin, att.id).await.unwrap();
    let filter = AvailabilityFilter::default();
    let listed = engine.list_availability(&admin, &filter).await.unwrap();
    match (reserved, deleted) {
        (Ok(booked), Err(EngineError::AlreadyBooked(id))) => {
            assert_eq!(id, wid);
            assert_eq!(booked.availability_id, Some(wid));
            assert_eq!(current.availability_id, Some(wid));
            assert!(listed.iter().any(|w| w.id == wid && w.is_booked));
        }
        (Err(EngineError::NotFound(id)), Ok(removed)) => {
            assert_eq!(id, wid);
            assert_eq!(removed.id, wid);
            assert!(!current.is_scheduled());
            assert!(listed.iter().all(|w| w.id != wid));
            assert_eq!(engine.window_professional(&wid), None);
        }
        (r, d) => panic!("both sides took effect or neither did: {r:?} / {d:?}"),
    }
}

#[tokio::test]
async fn booked_window_cannot_be_deleted() {
    let c = Clinic::open("delete_booked.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let att = c.intake().await;
    c.engine.reserve_availability(&c.admin, att.id, wid).await.unwrap();

    let err = c.engine.delete_availability(&c.admin, wid).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyBooked(id) if id == wid));
    assert_eq!(c.windows().await.len(), 1);
}

#[tokio::test]
async fn assigned_professional_must_match_window_owner() {
    let c = Clinic::open("reserve_wrong_pro.wal").await;
    let other = Ulid::new();
    c.engine
        .register_account(&c.admin, other, None, roles(&[Role::Professional]))
        .await
        .unwrap();
    let foreign = c
        .engine
        .create_availability_batch(&c.admin, other, vec![NewWindow::new(T0, T0 + H)])
        .await
        .unwrap()[0]
        .id;

    let att = c
        .engine
        .open_attendance(&c.admin, Ulid::new(), c.patient, Some(c.pro), None)
        .await
        .unwrap();
    let err = c
        .engine
        .reserve_availability(&c.admin, att.id, foreign)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn patient_cannot_reserve_for_someone_else() {
    let c = Clinic::open("reserve_foreign_patient.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let att = c.intake().await;
    let intruder = as_actor(Ulid::new(), &[Role::Patient]);

    let err = c
        .engine
        .reserve_availability(&intruder, att.id, wid)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden));
    assert!(!c.windows().await[0].is_booked);
}

#[tokio::test]
async fn reserve_unknown_ids() {
    let c = Clinic::open("reserve_unknown.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let att = c.intake().await;

    let missing = Ulid::new();
    let err = c.engine.reserve_availability(&c.admin, missing, wid).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));
    let err = c.engine.reserve_availability(&c.admin, att.id, missing).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));
}

#[tokio::test]
async fn waiter_on_an_abandoned_intake_sees_not_found() {
    let c = Clinic::open("reserve_abandoned_intake.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let admin = c.admin.clone();
    let engine = Arc::new(c.engine);

    // An intake whose WAL write is still in flight: mapped, but write-locked.
    let id = Ulid::new();
    let slot = Arc::new(RwLock::new(PendingAttendance::new(id, c.patient, None, None)));
    let pending = slot.clone().write_owned().await;
    engine.attendances.insert(id, slot);

    let waiter = {
        let engine = engine.clone();
        let admin = admin.clone();
        tokio::spawn(async move { engine.reserve_availability(&admin, id, wid).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The write failed: the slot is unmapped before its guard is released.
    engine.attendances.remove(&id);
    drop(pending);

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::NotFound(missing) if missing == id));
    let filter = AvailabilityFilter::default();
    let listed = engine.list_availability(&admin, &filter).await.unwrap();
    assert!(!listed[0].is_booked);
    assert!(matches!(
        engine.attendance(&admin, id).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Attendance details ───────────────────────────────────

#[tokio::test]
async fn update_details_respects_field_rights() {
    let c = Clinic::open("update_details.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let att = c.intake().await;
    c.engine.reserve_availability(&c.admin, att.id, wid).await.unwrap();

    let feedback = AttendanceChanges {
        feedback: Some("very helpful".into()),
        ..Default::default()
    };
    let updated = c
        .engine
        .update_attendance_details(&c.patient_actor(), att.id, feedback)
        .await
        .unwrap();
    assert_eq!(updated.feedback.as_deref(), Some("very helpful"));
    assert_eq!(updated.note.as_deref(), Some("first visit"));

    let note = AttendanceChanges {
        note: Some("patient edit".into()),
        ..Default::default()
    };
    let err = c
        .engine
        .update_attendance_details(&c.patient_actor(), att.id, note)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden));

    let duration = AttendanceChanges {
        duration_minutes: Some(45),
        ..Default::default()
    };
    let updated = c
        .engine
        .update_attendance_details(&c.pro_actor(), att.id, duration)
        .await
        .unwrap();
    assert_eq!(updated.duration_minutes, Some(45));
    assert_eq!(updated.feedback.as_deref(), Some("very helpful"));
}

#[tokio::test]
async fn date_at_follows_the_reserved_window() {
    let c = Clinic::open("update_date_at.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let att = c.intake().await;

    let move_to = |t: Ms| AttendanceChanges {
        date_at: Some(t),
        ..Default::default()
    };

    let err = c
        .engine
        .update_attendance_details(&c.admin, att.id, move_to(T0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidField { field: "date_at", .. }));

    c.engine.reserve_availability(&c.admin, att.id, wid).await.unwrap();
    let err = c
        .engine
        .update_attendance_details(&c.admin, att.id, move_to(T0 + H))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let same = c
        .engine
        .update_attendance_details(&c.admin, att.id, move_to(T0))
        .await
        .unwrap();
    assert_eq!(same.date_at, Some(T0));
}

#[tokio::test]
async fn update_details_rejects_bad_input() {
    let c = Clinic::open("update_bad_input.wal").await;
    let att = c.intake().await;

    let err = c
        .engine
        .update_attendance_details(&c.admin, att.id, AttendanceChanges::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let zero = AttendanceChanges {
        duration_minutes: Some(0),
        ..Default::default()
    };
    let err = c
        .engine
        .update_attendance_details(&c.admin, att.id, zero)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidField { field: "duration_minutes", .. }));
}

#[tokio::test]
async fn attendances_visible_only_to_involved_parties() {
    let c = Clinic::open("attendance_visibility.wal").await;
    let other_patient = Ulid::new();
    c.engine
        .register_account(&c.admin, other_patient, None, roles(&[Role::Patient]))
        .await
        .unwrap();
    let mine = c.intake().await;
    let theirs = c
        .engine
        .open_attendance(&c.admin, Ulid::new(), other_patient, None, None)
        .await
        .unwrap();

    let seen = c
        .engine
        .list_attendances(&c.patient_actor(), &AttendanceFilter::default())
        .await;
    assert_eq!(seen.iter().map(|a| a.id).collect::<Vec<_>>(), vec![mine.id]);

    let err = c
        .engine
        .attendance(&c.patient_actor(), theirs.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden));
}

#[tokio::test]
async fn open_attendance_needs_known_patient() {
    let c = Clinic::open("open_unknown_patient.wal").await;
    let ghost = Ulid::new();
    let err = c
        .engine
        .open_attendance(&c.admin, Ulid::new(), ghost, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == ghost));

    let id = Ulid::new();
    c.engine.open_attendance(&c.admin, id, c.patient, None, None).await.unwrap();
    let err = c
        .engine
        .open_attendance(&c.admin, id, c.patient, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

// ── Accounts and roles ───────────────────────────────────

#[tokio::test]
async fn revoking_professional_role_blocks_new_windows() {
    let c = Clinic::open("revoke_role.wal").await;
    c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap();

    let acc = c.engine.revoke_role(&c.admin, c.pro, Role::Professional).await.unwrap();
    assert!(!acc.roles.contains(&Role::Professional));

    let err = c
        .engine
        .create_availability_batch(&c.admin, c.pro, vec![NewWindow::new(T0 + H, T0 + 2 * H)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotEligible(_)));

    let acc = c.engine.grant_role(&c.admin, c.pro, Role::Professional).await.unwrap();
    assert!(acc.roles.contains(&Role::Professional));
    // Granting again is a no-op.
    let again = c.engine.grant_role(&c.admin, c.pro, Role::Professional).await.unwrap();
    assert_eq!(again.roles, acc.roles);
}

#[tokio::test]
async fn revocation_while_waiting_for_the_schedule_is_honored() {
    let c = Clinic::open("revoke_while_waiting.wal").await;
    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    let att = c.intake().await;
    let (admin, pro, pro_actor) = (c.admin.clone(), c.pro, c.pro_actor());
    let engine = Arc::new(c.engine);

    let schedule = engine.get_schedule(&pro).unwrap();
    let held = schedule.clone().write_owned().await;

    let publish = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .create_availability_batch(&pro_actor, pro, vec![NewWindow::new(T0 + H, T0 + 2 * H)])
                .await
        })
    };
    let reserve = {
        let engine = engine.clone();
        let admin = admin.clone();
        tokio::spawn(async move { engine.reserve_availability(&admin, att.id, wid).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    engine.revoke_role(&admin, pro, Role::Professional).await.unwrap();
    drop(held);

    let err = publish.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::NotEligible(id) if id == pro));
    let err = reserve.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::NotEligible(id) if id == pro));

    let filter = AvailabilityFilter::default();
    let listed = engine.list_availability(&admin, &filter).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].is_booked);
}

#[tokio::test]
async fn role_change_on_an_abandoned_registration_is_not_found() {
    let c = Clinic::open("role_abandoned_account.wal").await;
    let admin = c.admin.clone();
    let engine = Arc::new(c.engine);

    let id = Ulid::new();
    let slot = Arc::new(RwLock::new(Account {
        id,
        name: None,
        roles: roles(&[Role::Patient]),
    }));
    let pending = slot.clone().write_owned().await;
    engine.accounts.insert(id, slot);

    let grant = {
        let engine = engine.clone();
        let admin = admin.clone();
        tokio::spawn(async move { engine.grant_role(&admin, id, Role::Staff).await })
    };
    let login = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.resolve_actor(id).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    engine.accounts.remove(&id);
    drop(pending);

    assert!(matches!(grant.await.unwrap(), Err(EngineError::NotFound(missing)) if missing == id));
    assert!(matches!(login.await.unwrap(), Err(EngineError::Forbidden)));
}

#[tokio::test]
async fn staff_enroll_patients_but_not_roles() {
    let c = Clinic::open("staff_enroll.wal").await;
    let staff = as_actor(Ulid::new(), &[Role::Staff]);

    c.engine
        .register_account(&staff, Ulid::new(), None, roles(&[Role::Patient]))
        .await
        .unwrap();
    let err = c
        .engine
        .register_account(&staff, Ulid::new(), None, roles(&[Role::Professional]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden));
    let err = c
        .engine
        .grant_role(&staff, c.patient, Role::Staff)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden));

    let err = c
        .engine
        .register_account(&c.admin, c.patient, None, roles(&[Role::Patient]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn resolve_actor_reflects_current_roles() {
    let c = Clinic::open("resolve_actor.wal").await;
    let actor = c.engine.resolve_actor(c.patient).await.unwrap();
    assert_eq!(actor.roles, roles(&[Role::Patient]));

    c.engine.grant_role(&c.admin, c.patient, Role::Staff).await.unwrap();
    let actor = c.engine.resolve_actor(c.patient).await.unwrap();
    assert!(actor.has_role(Role::Staff));

    assert!(matches!(
        c.engine.resolve_actor(Ulid::new()).await,
        Err(EngineError::Forbidden)
    ));
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn professional_listeners_see_schedule_changes() {
    let c = Clinic::open("notify_schedule.wal").await;
    let mut rx = c.engine.notify.subscribe(c.pro);

    let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
    match rx.recv().await.unwrap() {
        Event::AvailabilityCreated { professional_id, windows } => {
            assert_eq!(professional_id, c.pro);
            assert_eq!(windows, vec![(wid, Span::new(T0, T0 + H))]);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let att = c.intake().await;
    c.engine.reserve_availability(&c.admin, att.id, wid).await.unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::AttendanceReserved { id, window_id, .. } if id == att.id && window_id == wid
    ));
}

#[tokio::test]
async fn intake_is_not_broadcast_to_schedule_listeners() {
    let c = Clinic::open("notify_intake.wal").await;
    let mut rx = c.engine.notify.subscribe(c.pro);

    c.engine
        .open_attendance(&c.admin, Ulid::new(), c.patient, Some(c.pro), Some("private history".into()))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());

    c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), Event::AvailabilityCreated { .. }));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_bookings() {
    let path = test_wal_path("replay_bookings.wal");
    let (pro, patient, att_id, wid) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let c = Clinic::enroll(engine).await;
        let created = c
            .publish(vec![NewWindow::new(T0, T0 + H), NewWindow::new(T0 + H, T0 + 2 * H)])
            .await
            .unwrap();
        let att = c.intake().await;
        c.engine.reserve_availability(&c.admin, att.id, created[1].id).await.unwrap();
        c.engine.delete_availability(&c.admin, created[0].id).await.unwrap();
        (c.pro, c.patient, att.id, created[1].id)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let admin = Actor::system();
    let att = engine.attendance(&admin, att_id).await.unwrap();
    assert_eq!(att.patient_id, patient);
    assert_eq!(att.availability_id, Some(wid));
    assert_eq!(att.date_at, Some(T0 + H));

    let windows = engine
        .list_availability(&admin, &AvailabilityFilter::default())
        .await
        .unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].professional_id, pro);
    assert!(windows[0].is_booked);
    assert_eq!(engine.window_professional(&wid), Some(pro));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let (att_id, wid) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let c = Clinic::enroll(engine).await;
        for i in 0..10 {
            let w = c.publish(vec![NewWindow::new(T0 + i * H, T0 + (i + 1) * H)]).await.unwrap();
            c.engine.delete_availability(&c.admin, w[0].id).await.unwrap();
        }
        let wid = c.publish(vec![NewWindow::new(T0, T0 + H)]).await.unwrap()[0].id;
        let att = c.intake().await;
        c.engine.reserve_availability(&c.admin, att.id, wid).await.unwrap();
        c.engine
            .update_attendance_details(
                &c.admin,
                att.id,
                AttendanceChanges {
                    duration_minutes: Some(30),
                    feedback: Some("ok".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(c.engine.wal_appends_since_compact().await > 20);
        let before = std::fs::metadata(&path).unwrap().len();
        c.engine.compact_wal().await.unwrap();
        assert_eq!(c.engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
        (att.id, wid)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let admin = Actor::system();
    let att = engine.attendance(&admin, att_id).await.unwrap();
    assert_eq!(att.availability_id, Some(wid));
    assert_eq!(att.duration_minutes, Some(30));
    assert_eq!(att.feedback.as_deref(), Some("ok"));
    assert_eq!(att.note.as_deref(), Some("first visit"));

    let windows = engine
        .list_availability(&admin, &AvailabilityFilter::default())
        .await
        .unwrap();
    assert_eq!(windows.len(), 1);
    assert!(windows[0].is_booked);
}

#[tokio::test]
async fn expired_windows_exclude_booked() {
    let c = Clinic::open("expired_windows.wal").await;
    let created = c
        .publish(vec![NewWindow::new(T0, T0 + H), NewWindow::new(T0 + H, T0 + 2 * H)])
        .await
        .unwrap();
    let att = c.intake().await;
    c.engine.reserve_availability(&c.admin, att.id, created[1].id).await.unwrap();

    assert!(c.engine.collect_expired_windows(T0 + H - 1).await.is_empty());
    assert_eq!(c.engine.collect_expired_windows(T0 + 3 * H).await, vec![created[0].id]);
}
