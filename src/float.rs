/// Score wrapper that displays minimal decimal places, at most 3.
#[derive(Debug, Clone, Copy)]
pub struct TerseF64(pub f64);

impl std::fmt::Display for TerseF64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if pseudo_int(self.0) {
            write!(f, "{:.0}", self.0)
        } else if pseudo_int(self.0 * 10.0) {
            write!(f, "{:.1}", self.0)
        } else if pseudo_int(self.0 * 100.0) {
            write!(f, "{:.2}", self.0)
        } else {
            write!(f, "{:.3}", self.0)
        }
    }
}

#[inline]
fn pseudo_int(f: f64) -> bool {
    !(0.0002..=0.9998).contains(&f.fract().abs())
}

#[test]
fn terse_scores() {
    assert_eq!(TerseF64(100.0).to_string(), "100");
    assert_eq!(TerseF64(42.5).to_string(), "42.5");
    assert_eq!(TerseF64(95.25).to_string(), "95.25");
    assert_eq!(TerseF64(0.123456).to_string(), "0.123");
    assert_eq!(TerseF64(-640.0).to_string(), "-640");
}
