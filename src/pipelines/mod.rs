pub mod kallisto_quant;
