use num_complex::Complex;
use proptest::prelude::*;
use tessera_comm::{Channel, Collectives, Communicator, LocalFabric, RankGroup, Tag};
use tessera_core::ErrorKind;

#[test]
fn test_broadcast_from_every_root() {
    for root in 0..5 {
        let results = LocalFabric::run(5, |comm| {
            let group = RankGroup::all(comm.size());
            let mut data = if comm.rank() == root {
                vec![Complex::new(root as f64, 1.0), Complex::new(2.0, -3.0)]
            } else {
                Vec::new()
            };
            comm.broadcast(&mut data, root, &group, Tag::new(Channel::Broadcast, root))
                .map(|_| data)
        })
        .unwrap();
        for data in results {
            assert_eq!(data.unwrap(), vec![Complex::new(root as f64, 1.0), Complex::new(2.0, -3.0)]);
        }
    }
}

#[test]
fn test_broadcast_preserves_issue_order() {
    let results = LocalFabric::run(4, |comm| {
        let group = RankGroup::all(comm.size());
        let tag = Tag::new(Channel::Panel, 0);
        let mut seen = Vec::new();
        for round in 0..6u32 {
            let mut data = vec![round; 3];
            comm.broadcast(&mut data, 1, &group, tag)?;
            seen.push(data[0]);
        }
        Ok::<_, tessera_core::Error>(seen)
    })
    .unwrap();
    for seen in results {
        assert_eq!(seen.unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }
}

#[test]
fn test_subgroup_collectives_skip_non_members() {
    let results = LocalFabric::run(6, |comm| {
        let group = RankGroup::new([1, 3, 5]);
        if !group.contains(comm.rank()) {
            return Ok(None);
        }
        let mut value = [comm.rank() as i64];
        comm.all_reduce(&mut value, |acc, x| acc[0] = acc[0].max(x[0]), &group, Tag::new(Channel::Reduce, 1))?;
        comm.barrier(&group, Tag::new(Channel::Barrier, 1))?;
        Ok::<_, tessera_core::Error>(Some(value[0]))
    })
    .unwrap();
    let values: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(values, vec![None, Some(5), None, Some(5), None, Some(5)]);
}

#[test]
fn test_reduce_is_reproducible() {
    let run = || {
        LocalFabric::run(7, |comm| {
            let group = RankGroup::all(comm.size());
            let mut data = vec![0.1f64 * (comm.rank() as f64 + 1.0), 1e-17];
            comm.reduce(
                &mut data,
                |acc, x| acc.iter_mut().zip(x).for_each(|(a, b)| *a += *b),
                3,
                &group,
                Tag::new(Channel::Reduce, 0),
            )?;
            Ok::<_, tessera_core::Error>(data)
        })
        .unwrap()
        .remove(3)
        .unwrap()
    };
    let first = run();
    assert!((first[0] - 2.8).abs() < 1e-12);
    for _ in 0..3 {
        assert_eq!(run(), first);
    }
}

#[test]
fn test_gather_in_group_order() {
    let results = LocalFabric::run(4, |comm| {
        let group = RankGroup::all(comm.size());
        let data = vec![comm.rank() as u32; comm.rank() + 1];
        comm.gather_to(&data, 2, &group, Tag::new(Channel::Gather, 0))
    })
    .unwrap();
    for (rank, r) in results.into_iter().enumerate() {
        let gathered = r.unwrap();
        if rank == 2 {
            let parts = gathered.unwrap();
            assert_eq!(parts.len(), 4);
            assert_eq!(parts[3], vec![3, 3, 3, 3]);
        } else {
            assert!(gathered.is_none());
        }
    }
}

#[test]
fn test_failed_rank_unblocks_peers() {
    let results = LocalFabric::run(3, |comm| {
        if comm.rank() == 0 {
            return Err(tessera_core::Error::InvalidState("rank 0 gives up".to_string()));
        }
        let group = RankGroup::all(comm.size());
        let mut data: Vec<f64> = Vec::new();
        comm.broadcast(&mut data, 0, &group, Tag::new(Channel::Broadcast, 0))
    })
    .unwrap();
    assert_eq!(results[0].as_ref().unwrap_err().kind(), ErrorKind::Usage);
    for r in &results[1..] {
        assert_eq!(r.as_ref().unwrap_err().kind(), ErrorKind::Communication);
    }
}

#[test]
fn test_size_mismatch_is_a_communication_error() {
    let results = LocalFabric::run(2, |comm| {
        let tag = Tag::new(Channel::Tile, 0);
        if comm.rank() == 0 {
            comm.send(1, tag, vec![0u8; 5])?;
            Ok(Vec::new())
        } else {
            comm.recv_vec::<f32>(0, tag)
        }
    })
    .unwrap();
    assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::Communication);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_all_reduce_sum_matches_serial(size in 1usize..6, len in 0usize..5) {
        let results = LocalFabric::run(size, |comm| {
            let group = RankGroup::all(comm.size());
            let mut data: Vec<i64> = (0..len).map(|i| (comm.rank() * 10 + i) as i64).collect();
            comm.all_reduce(
                &mut data,
                |acc, x| acc.iter_mut().zip(x).for_each(|(a, b)| *a += *b),
                &group,
                Tag::new(Channel::Reduce, 0),
            )
            .map(|_| data)
        })
        .unwrap();
        let expected: Vec<i64> = (0..len)
            .map(|i| (0..size).map(|r| (r * 10 + i) as i64).sum())
            .collect();
        for r in results {
            prop_assert_eq!(r.unwrap(), expected.clone());
        }
    }
}
