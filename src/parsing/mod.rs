pub mod lineproto;
