mod common;

use common::{RW, manager, va};
use kernel_alloc::VmError;
use kernel_alloc::vmm::{self, Backing, ProcessMemory};
use kernel_memory_addresses::PAGE_SIZE;
use proptest::prelude::*;

const BASE: u64 = 0x100_0000;

#[derive(Debug, Clone)]
enum Op {
    Map { page: u64, pages: u64 },
    Unmap { page: u64, pages: u64 },
    Write { page: u64, byte: u8 },
    Fork,
    DropChild,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0_u64..32, 1_u64..5).prop_map(|(page, pages)| Op::Map { page, pages }),
        2 => (0_u64..32, 1_u64..5).prop_map(|(page, pages)| Op::Unmap { page, pages }),
        3 => (0_u64..36, any::<u8>()).prop_map(|(page, byte)| Op::Write { page, byte }),
        1 => Just(Op::Fork),
        1 => Just(Op::DropChild),
    ]
}

proptest! {
    #[test]
    fn segments_never_overlap(requests in prop::collection::vec((0_u64..48, 1_u64..6), 1..24)) {
        let mm = manager(512);
        let pm = ProcessMemory::new(&mm).unwrap();
        let mut model: Vec<(u64, u64)> = Vec::new();

        for (page, pages) in requests {
            let at = va(BASE + page * PAGE_SIZE);
            let result = vmm::map(&pm, Some(at), pages * PAGE_SIZE, RW, Backing::Anonymous);
            let overlaps = model.iter().any(|&(s, e)| s < page + pages && page < e);
            if overlaps {
                prop_assert_eq!(result, Err(VmError::Collision));
            } else {
                prop_assert_eq!(result, Ok(at));
                model.push((page, page + pages));
            }

            let segments = pm.segments();
            prop_assert_eq!(segments.len(), model.len());
            for pair in segments.windows(2) {
                prop_assert!(pair[0].end() <= pair[1].start);
            }
        }
    }

    #[test]
    fn every_frame_comes_back(ops in prop::collection::vec(arb_op(), 1..32)) {
        let mm = manager(512);
        let before = mm.buddy_snapshot();
        {
            let pm = ProcessMemory::new(&mm).unwrap();
            let mut children = Vec::new();
            for op in ops {
                match op {
                    Op::Map { page, pages } => {
                        let _ = vmm::map(
                            &pm,
                            Some(va(BASE + page * PAGE_SIZE)),
                            pages * PAGE_SIZE,
                            RW,
                            Backing::Anonymous,
                        );
                    }
                    Op::Unmap { page, pages } => {
                        vmm::unmap_range(&pm, va(BASE + page * PAGE_SIZE), pages * PAGE_SIZE).unwrap();
                    }
                    Op::Write { page, byte } => {
                        let at = va(BASE + page * PAGE_SIZE);
                        let mapped = pm.translate(at).is_some();
                        prop_assert_eq!(pm.write_user(at, &[byte]).is_ok(), mapped);
                        if mapped {
                            let mut buf = [0_u8; 1];
                            pm.read_user(at, &mut buf).unwrap();
                            prop_assert_eq!(buf[0], byte);
                        }
                    }
                    Op::Fork => children.push(vmm::fork_address_space(&pm).unwrap()),
                    Op::DropChild => {
                        children.pop();
                    }
                }
            }
        }
        prop_assert_eq!(mm.buddy_snapshot(), before);
    }
}
