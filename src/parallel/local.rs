//! In-process communicator: one thread per rank, barrier-synchronised

use super::Communicator;
use candle_core::{Error, Result, Tensor};
use std::sync::{Arc, Barrier, Mutex};

#[derive(Debug)]
struct Exchange {
    slots: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

/// One rank of a group whose ranks all live in the current process
///
/// Build the whole group with [`LocalCommunicator::group`] and move each
/// member to its own thread. Collectives block until every rank arrives.
#[derive(Debug, Clone)]
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    exchange: Arc<Exchange>,
}

impl LocalCommunicator {
    pub fn group(size: usize) -> Vec<Self> {
        let exchange = Arc::new(Exchange {
            slots: Mutex::new(vec![None; size]),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                exchange: exchange.clone(),
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        {
            let mut slots = self
                .exchange
                .slots
                .lock()
                .map_err(|_| Error::Msg("communicator slots poisoned".to_string()))?;
            slots[self.rank] = Some(tensor.clone());
        }
        self.exchange.barrier.wait();

        let gathered = {
            let slots = self
                .exchange
                .slots
                .lock()
                .map_err(|_| Error::Msg("communicator slots poisoned".to_string()))?;
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone()
                        .ok_or_else(|| Error::Msg(format!("rank {rank} did not contribute")))
                })
                .collect::<Result<Vec<_>>>()
        };

        // Nobody may overwrite a slot before every rank has read it
        self.exchange.barrier.wait();

        gathered?
            .into_iter()
            .map(|t| t.to_device(tensor.device()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    #[test]
    fn test_all_gather_rank_order() {
        let handles: Vec<_> = LocalCommunicator::group(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let t = Tensor::new(&[comm.rank() as f32], &Device::Cpu).unwrap();
                    let first = comm.all_gather(&t).unwrap();
                    // A second round reuses the slots
                    let second = comm.all_gather(&(t + 10.0).unwrap()).unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.join().unwrap();
            let first: Vec<f32> = first
                .iter()
                .map(|t| t.to_vec1::<f32>().unwrap()[0])
                .collect();
            let second: Vec<f32> = second
                .iter()
                .map(|t| t.to_vec1::<f32>().unwrap()[0])
                .collect();
            assert_eq!(first, vec![0.0, 1.0, 2.0]);
            assert_eq!(second, vec![10.0, 11.0, 12.0]);
        }
    }
}
