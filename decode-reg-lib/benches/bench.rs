use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rand::Rng;

use decode_reg_lib::acq::{decode_atoms,
                          read_ring};
use decode_reg_lib::bits::{extract,
                           insert};
use decode_reg_lib::decoder::Decoder;
use decode_reg_lib::modules::{simulated_board,
                              ModuleKind};
use decode_reg_lib::sim::SimRegion;
use decode_reg_lib::Settings;

fn random_bytes(n : usize) -> Vec<u8> {
  let mut rng = rand::thread_rng();
  (0..n).map(|_| rng.gen::<u8>()).collect()
}

fn bench_decode_atoms(c: &mut Criterion) {
  // one acquisition of 64k samples with 2 atoms each
  let bytes = random_bytes(1 << 18);
  c.bench_function("decode_atoms_16_signed", |b|
                   b.iter(|| decode_atoms(black_box(&bytes), 16, true)));
  c.bench_function("decode_atoms_8_unsigned", |b|
                   b.iter(|| decode_atoms(black_box(&bytes), 8, false)));
}

fn bench_read_ring(c: &mut Criterion) {
  let sample = SimRegion::new(1 << 20);
  sample.poke_bytes(0, &random_bytes(1 << 20));
  c.bench_function("read_ring_wrapping", |b|
                   b.iter(|| read_ring(&sample, 0, 1 << 20, black_box((1 << 20) - 0x1000), 1 << 16)));
}

fn bench_bit_fields(c: &mut Criterion) {
  c.bench_function("insert_extract", |b|
                   b.iter(|| {
                     let word = insert(black_box(0xdead_beef), -3, 0x0000_ff00, true).unwrap_or(0);
                     extract(word, 0x0000_ff00, true)
                   }));
}

fn bench_decode_pos_calc(c: &mut Criterion) {
  let mut settings = Settings::new();
  let device      = match simulated_board(&mut settings) {
    Err(err) => panic!("Can't build simulated board! {err}"),
    Ok(dev)  => dev,
  };
  let mut decoder = match ModuleKind::PosCalc.open_decoder(&device, &settings, 0) {
    Ok(Some(decoder)) => decoder,
    _                 => panic!("No position calculation core on the simulated board!"),
  };
  c.bench_function("decode_pos_calc", |b|
                   b.iter(|| decoder.get_data()));
}

criterion_group!(benches,
                 bench_decode_atoms,
                 bench_read_ring,
                 bench_bit_fields,
                 bench_decode_pos_calc);
criterion_main!(benches);
